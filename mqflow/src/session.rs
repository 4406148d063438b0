use std::sync::Arc;

use tokio::sync::mpsc;

use crate::ack::OutboundAckCoordinator;
use crate::completion::Completion;
use crate::connection::{ClientConnection, ConnectInfo};
use crate::context::ServerContext;
use crate::delivery::DeliveryTarget;
use crate::error::{ChannelClosed, MqttError};
use crate::inbound::{InboundDecision, InboundQoSTracker};
use crate::inflight::OutboundOrderingEngine;
use crate::transport::Transport;
use crate::types::{Packet, PacketId, Publish, PublishAckReason, PublishStatus, QoS};

/// Input of a session task.
#[derive(Debug)]
pub enum SessionEvent {
    /// A packet read from the client.
    Incoming(Packet),
    /// An outbound publish taken from one of the client's queues.
    Deliver(Box<Publish>, DeliveryTarget),
    /// PUBREL of a QoS 2 flow left open by an earlier connection.
    ResendPubrel(PacketId),
    Close,
}

/// The task owning all per-connection flow state.
pub struct Session {
    scx: ServerContext,
    conn: Arc<ClientConnection>,
    rx: mpsc::UnboundedReceiver<SessionEvent>,
    outbound: OutboundOrderingEngine,
    inbound: InboundQoSTracker,
    acks: OutboundAckCoordinator,
}

impl Session {
    pub(crate) fn new(scx: ServerContext, info: ConnectInfo, transport: Arc<dyn Transport>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(ClientConnection::new(info, transport.clone(), tx));
        let max_inflight = conn.max_inflight_window(scx.config.max_inflight_window);
        let outbound =
            OutboundOrderingEngine::new(conn.id().clone(), transport.clone(), max_inflight, scx.stats.clone());
        let inbound =
            InboundQoSTracker::new(conn.id().clone(), transport, scx.flow_records.clone(), scx.stats.clone())
                .reason_codes(conn.protocol().has_reason_codes());
        let acks = OutboundAckCoordinator::new(conn.clone(), scx.queue.clone());
        Self { scx, conn, rx, outbound, inbound, acks }
    }

    #[inline]
    pub fn connection(&self) -> &Arc<ClientConnection> {
        &self.conn
    }

    pub async fn run(mut self) {
        log::debug!("{} session started, max inflight {}", self.conn.id(), self.outbound.max_inflight());
        self.scx.poll.poll_messages(self.conn.id(), &self.conn);

        let mut inactive = self.conn.transport().inactive();
        loop {
            let ev = tokio::select! {
                biased;
                _ = &mut inactive => None,
                ev = self.rx.recv() => ev,
            };
            let ev = match ev {
                Some(SessionEvent::Close) | None => break,
                Some(ev) => ev,
            };
            if let Err(e) = self.process(ev).await {
                log::warn!("{} {}, closing connection", self.conn.id(), e);
                break;
            }
        }
        self.conn.transport().close().await;
        self.on_closed().await;
    }

    async fn process(&mut self, ev: SessionEvent) -> Result<(), MqttError> {
        match ev {
            SessionEvent::Incoming(packet) => self.on_incoming(packet).await?,
            SessionEvent::Deliver(publish, target) => self.deliver(*publish, target),
            SessionEvent::ResendPubrel(packet_id) => {
                let completion = self.scx.pipeline.track_pubrel(&self.conn, packet_id);
                self.outbound.submit_pubrel(packet_id, completion);
            }
            SessionEvent::Close => {}
        }
        Ok(())
    }

    fn deliver(&mut self, mut publish: Publish, target: DeliveryTarget) {
        if publish.qos > QoS::AtMostOnce && publish.packet_id.is_none() {
            match self.conn.packet_ids().allocate() {
                Ok(packet_id) => publish.packet_id = Some(packet_id),
                Err(e) => log::warn!("{} {}, publish {} fails", self.conn.id(), e, publish.unique_id),
            }
        }
        if self.outbound.is_retransmit(&publish) {
            // The flow already has a tracked handle in the engine.
            self.conn.end_delivery();
            self.outbound.submit(publish, Completion::new());
            return;
        }
        let completion = self.scx.pipeline.track(&self.conn, &publish, target);
        self.outbound.submit(publish, completion);
    }

    async fn on_incoming(&mut self, packet: Packet) -> Result<(), MqttError> {
        match packet {
            Packet::Publish(publish) => self.on_publish(*publish).await?,
            Packet::PublishAck(ack) => self.acks.on_puback(&mut self.outbound, ack),
            Packet::PublishReceived(ack) => self.acks.on_pubrec(&mut self.outbound, ack).await,
            Packet::PublishComplete(ack) => self.acks.on_pubcomp(&mut self.outbound, ack),
            Packet::PublishRelease(rel) => self.inbound.on_pubrel(rel.packet_id).await,
        }
        Ok(())
    }

    async fn on_publish(&mut self, publish: Publish) -> Result<(), MqttError> {
        let qos = publish.qos;
        if qos == QoS::AtMostOnce {
            self.dispatch(publish).await;
            return Ok(());
        }

        let packet_id = publish
            .packet_id
            .ok_or_else(|| MqttError::ProtocolViolation(format!("QoS {} PUBLISH without packet id", qos.value())))?;
        let reason_code = match self.inbound.on_publish(packet_id, publish).await {
            InboundDecision::Forward(publish) => self.dispatch(publish).await,
            InboundDecision::Duplicate => PublishAckReason::Success,
        };
        let reason_code =
            if self.conn.protocol().has_reason_codes() { reason_code } else { PublishAckReason::Success };
        self.inbound.acknowledge(qos, packet_id, reason_code).await;
        Ok(())
    }

    async fn dispatch(&self, publish: Publish) -> PublishAckReason {
        match self.scx.dispatcher.dispatch(self.conn.id(), publish).await {
            Ok(reason_code) => reason_code,
            Err(e) => {
                log::warn!("{} dispatch failed, {:?}", self.conn.id(), e);
                PublishAckReason::ImplementationSpecificError
            }
        }
    }

    async fn on_closed(mut self) {
        self.outbound.on_channel_inactive();

        self.rx.close();
        while let Ok(ev) = self.rx.try_recv() {
            match ev {
                SessionEvent::Deliver(publish, target) => {
                    let completion = self.scx.pipeline.track(&self.conn, &publish, target);
                    completion.resolve(Err(ChannelClosed));
                }
                SessionEvent::ResendPubrel(packet_id) => {
                    let completion = self.scx.pipeline.track_pubrel(&self.conn, packet_id);
                    completion.resolve(Ok(PublishStatus::NotConnected));
                }
                SessionEvent::Incoming(packet) => {
                    log::debug!("{} dropped {:?} received after close", self.conn.id(), packet)
                }
                SessionEvent::Close => {}
            }
        }

        self.inbound.on_connection_closed(self.conn.expire_on_disconnect()).await;
        self.scx.registry.remove(&self.conn);
        self.conn.closed().resolve(());
        log::debug!("{} session closed", self.conn.id());
    }
}
