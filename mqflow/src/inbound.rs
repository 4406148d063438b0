use std::sync::Arc;

use crate::stats::Stats;
use crate::store::FlowRecordStore;
use crate::transport::Transport;
use crate::types::{
    ClientId, FlowRecord, HashSet, Packet, PacketId, Publish, PublishAck, PublishAck2, PublishAck2Reason,
    PublishAckReason, QoS,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundDecision {
    /// Hand the message to downstream processing.
    Forward(Publish),
    /// A retransmission of a message already forwarded.
    Duplicate,
}

/// Duplicate detection for inbound QoS 1/2 publishes of one connection.
///
/// The flow record store survives restarts, the local `delivered` set only lives as
/// long as the connection and lets retransmissions be answered without a lookup miss.
pub struct InboundQoSTracker {
    client_id: ClientId,
    transport: Arc<dyn Transport>,
    store: Arc<dyn FlowRecordStore>,
    stats: Arc<Stats>,
    delivered: HashSet<PacketId>,
    reason_codes: bool,
}

impl InboundQoSTracker {
    pub fn new(
        client_id: ClientId,
        transport: Arc<dyn Transport>,
        store: Arc<dyn FlowRecordStore>,
        stats: Arc<Stats>,
    ) -> Self {
        Self { client_id, transport, store, stats, delivered: HashSet::default(), reason_codes: true }
    }

    /// Clients before MQTT 5 only ever see a successful PUBCOMP.
    #[inline]
    pub fn reason_codes(mut self, enabled: bool) -> Self {
        self.reason_codes = enabled;
        self
    }

    pub async fn on_publish(&mut self, packet_id: PacketId, publish: Publish) -> InboundDecision {
        let existing = match self.store.get(&self.client_id, packet_id).await {
            Ok(record) => record,
            Err(e) => {
                log::warn!("{} flow record lookup for {} failed, {:?}", self.client_id, packet_id, e);
                None
            }
        };

        match existing {
            None => {
                self.persist(packet_id, &publish).await;
                self.mark_delivered(packet_id);
                InboundDecision::Forward(publish)
            }
            Some(_) if publish.dup => {
                if self.delivered.contains(&packet_id) {
                    log::debug!("{} duplicate publish {} suppressed", self.client_id, packet_id);
                    InboundDecision::Duplicate
                } else {
                    self.mark_delivered(packet_id);
                    InboundDecision::Forward(publish)
                }
            }
            Some(_) => {
                //A new flow reusing a packet id that is still open at the broker.
                log::debug!("{} packet id {} reused without DUP, replacing open flow", self.client_id, packet_id);
                self.persist(packet_id, &publish).await;
                self.mark_delivered(packet_id);
                InboundDecision::Forward(publish)
            }
        }
    }

    /// Sends PUBACK or PUBREC. A QoS 1 flow, or a QoS 2 flow refused in its PUBREC,
    /// ends once the acknowledgment is written.
    pub async fn acknowledge(&mut self, qos: QoS, packet_id: PacketId, reason_code: PublishAckReason) {
        let (packet, ends_flow) = match qos {
            QoS::AtMostOnce => return,
            QoS::AtLeastOnce => (Packet::PublishAck(PublishAck::new(packet_id, reason_code)), true),
            QoS::ExactlyOnce => (
                Packet::PublishReceived(PublishAck::new(packet_id, reason_code)),
                !reason_code.continues_handshake(),
            ),
        };
        match self.transport.write(packet).await {
            Ok(()) if ends_flow => self.finish_flow(packet_id).await,
            Ok(()) => {}
            Err(e) => log::debug!("{} acknowledgment for {} not written, {}", self.client_id, packet_id, e),
        }
    }

    pub async fn on_pubrel(&mut self, packet_id: PacketId) {
        let known = self.delivered.contains(&packet_id)
            || matches!(self.store.get(&self.client_id, packet_id).await, Ok(Some(_)));

        if let Err(e) = self.store.put_or_replace(&self.client_id, packet_id, FlowRecord::Pubrel(packet_id)).await {
            log::warn!("{} failed to persist PUBREL {}, {:?}", self.client_id, packet_id, e);
        }

        let reason_code = if known || !self.reason_codes {
            PublishAck2Reason::Success
        } else {
            PublishAck2Reason::PacketIdNotFound
        };
        match self.transport.write(Packet::PublishComplete(PublishAck2::new(packet_id, reason_code))).await {
            Ok(()) => self.finish_flow(packet_id).await,
            Err(e) => log::debug!("{} PUBCOMP for {} not written, {}", self.client_id, packet_id, e),
        }
    }

    /// Drops connection local state; with `expire` the session ends and its records go too.
    pub async fn on_connection_closed(&mut self, expire: bool) {
        self.stats.in_inflights.decs(self.delivered.len() as isize);
        self.delivered.clear();
        if expire {
            if let Err(e) = self.store.delete_all(&self.client_id).await {
                log::warn!("{} failed to delete flow records, {:?}", self.client_id, e);
            }
        }
    }

    #[inline]
    pub fn is_delivered(&self, packet_id: PacketId) -> bool {
        self.delivered.contains(&packet_id)
    }

    async fn persist(&self, packet_id: PacketId, publish: &Publish) {
        let record = FlowRecord::Publish(Box::new(publish.clone()));
        if let Err(e) = self.store.put_or_replace(&self.client_id, packet_id, record).await {
            log::warn!("{} failed to persist flow record {}, forwarding anyway, {:?}", self.client_id, packet_id, e);
        }
    }

    #[inline]
    fn mark_delivered(&mut self, packet_id: PacketId) {
        if self.delivered.insert(packet_id) {
            self.stats.in_inflights.inc();
        }
    }

    async fn finish_flow(&mut self, packet_id: PacketId) {
        if let Err(e) = self.store.remove(&self.client_id, packet_id).await {
            log::warn!("{} failed to remove flow record {}, {:?}", self.client_id, packet_id, e);
        }
        if self.delivered.remove(&packet_id) {
            self.stats.in_inflights.dec();
        }
    }
}
