use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::connection::{ClientConnection, ConnectInfo};
use crate::delivery::DeliveryCompletionPipeline;
use crate::dispatch::{DefaultDispatcher, Dispatcher};
use crate::poll::{PollService, QueuePoller};
use crate::queue::{ClientQueue, RamClientQueue};
use crate::registry::ConnectionRegistry;
use crate::session::Session;
use crate::stats::Stats;
use crate::store::{FlowRecordStore, PayloadStore, RamFlowRecordStore, RamPayloadStore};
use crate::transport::Transport;

/// Runtime view of the `mqtt` settings section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowConfig {
    pub max_inflight_window: u16,
    pub publish_poll_batch_size: usize,
    pub shutdown_partition_size: usize,
    pub shutdown_legacy: bool,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self::from(&mqflow_conf::Mqtt::default())
    }
}

impl From<&mqflow_conf::Mqtt> for FlowConfig {
    #[inline]
    fn from(mqtt: &mqflow_conf::Mqtt) -> Self {
        Self {
            max_inflight_window: mqtt.max_inflight_window,
            publish_poll_batch_size: mqtt.publish_poll_batch_size,
            shutdown_partition_size: mqtt.shutdown_partition_size,
            shutdown_legacy: mqtt.shutdown_legacy,
        }
    }
}

#[derive(Clone)]
pub struct ServerContext {
    inner: Arc<ServerContextInner>,
}

pub struct ServerContextInner {
    pub config: FlowConfig,
    pub stats: Arc<Stats>,
    pub registry: ConnectionRegistry,
    pub flow_records: Arc<dyn FlowRecordStore>,
    pub payloads: Arc<dyn PayloadStore>,
    pub queue: Arc<dyn ClientQueue>,
    pub poll: Arc<dyn PollService>,
    pub pipeline: Arc<DeliveryCompletionPipeline>,
    pub dispatcher: Arc<dyn Dispatcher>,
}

impl Deref for ServerContext {
    type Target = ServerContextInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl ServerContext {
    #[inline]
    pub fn builder(config: FlowConfig) -> ServerContextBuilder {
        ServerContextBuilder::new(config)
    }

    /// Registers the connection and spawns its session. When the client id is already
    /// registered nothing is started and the live connection is returned as the error.
    pub fn start_session(
        &self,
        info: ConnectInfo,
        transport: Arc<dyn Transport>,
    ) -> std::result::Result<Arc<ClientConnection>, Arc<ClientConnection>> {
        let session = Session::new(self.clone(), info, transport);
        let conn = session.connection().clone();
        if let Some(existing) = self.registry.insert_if_absent(conn.clone()) {
            log::debug!("{} is already connected, {:?}", conn.id(), existing);
            return Err(existing);
        }
        tokio::spawn(session.run());
        Ok(conn)
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ServerContext {{ config: {:?}, connections: {} }}", self.config, self.registry.len())
    }
}

pub struct ServerContextBuilder {
    config: FlowConfig,
    flow_records: Option<Arc<dyn FlowRecordStore>>,
    payloads: Option<Arc<dyn PayloadStore>>,
    queue: Option<(Arc<dyn ClientQueue>, Arc<dyn PollService>)>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
}

impl ServerContextBuilder {
    fn new(config: FlowConfig) -> Self {
        Self { config, flow_records: None, payloads: None, queue: None, dispatcher: None }
    }

    pub fn flow_records(mut self, store: Arc<dyn FlowRecordStore>) -> Self {
        self.flow_records = Some(store);
        self
    }

    pub fn payloads(mut self, store: Arc<dyn PayloadStore>) -> Self {
        self.payloads = Some(store);
        self
    }

    pub fn queue(mut self, queue: Arc<dyn ClientQueue>, poll: Arc<dyn PollService>) -> Self {
        self.queue = Some((queue, poll));
        self
    }

    /// In memory queue polled with the configured batch size.
    pub fn ram_queue(self, queue: Arc<RamClientQueue>) -> Self {
        let poll = Arc::new(QueuePoller::new(queue.clone(), self.config.publish_poll_batch_size));
        self.queue(queue, poll)
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn build(self) -> ServerContext {
        let config = self.config;
        let stats = Arc::new(Stats::new());
        let flow_records = self.flow_records.unwrap_or_else(|| Arc::new(RamFlowRecordStore::new()));
        let payloads = self.payloads.unwrap_or_else(|| Arc::new(RamPayloadStore::new()));
        let (queue, poll) = self.queue.unwrap_or_else(|| {
            let queue = Arc::new(RamClientQueue::new());
            let poll: Arc<dyn PollService> = Arc::new(QueuePoller::new(queue.clone(), config.publish_poll_batch_size));
            (queue, poll)
        });
        let dispatcher = self.dispatcher.unwrap_or_else(|| Arc::new(DefaultDispatcher));
        let pipeline = Arc::new(DeliveryCompletionPipeline::new(payloads.clone(), queue.clone(), poll.clone()));
        let registry = ConnectionRegistry::new(config.shutdown_partition_size, config.shutdown_legacy, stats.clone());

        ServerContext {
            inner: Arc::new(ServerContextInner {
                config,
                stats,
                registry,
                flow_records,
                payloads,
                queue,
                poll,
                pipeline,
                dispatcher,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::delivery::DeliveryTarget;
    use crate::dispatch::tests::RecordingDispatcher;
    use crate::transport::{ChannelTransport, Outgoing};
    use crate::types::{
        ClientId, FlowRecord, Packet, PacketId, ProtocolVersion, Publish, PublishAck, PublishAck2, PublishAck2Reason,
        PublishAckReason, QoS,
    };

    fn pid(v: u16) -> PacketId {
        PacketId::new(v).unwrap()
    }

    async fn next(out: &mut Outgoing) -> Packet {
        tokio::time::timeout(Duration::from_secs(5), out.recv()).await.unwrap().unwrap()
    }

    async fn eventually<F: Fn() -> bool>(cond: F) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached");
    }

    fn published_id(packet: &Packet) -> (PacketId, bool) {
        match packet {
            Packet::Publish(p) => (p.packet_id.unwrap(), p.dup),
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }

    #[test]
    fn flow_config_follows_settings() {
        let mut mqtt = mqflow_conf::Mqtt::default();
        mqtt.max_inflight_window = 8;
        mqtt.shutdown_legacy = true;
        let config = FlowConfig::from(&mqtt);
        assert_eq!(config.max_inflight_window, 8);
        assert!(config.shutdown_legacy);
        assert_eq!(FlowConfig::default().shutdown_partition_size, 100);
    }

    #[tokio::test]
    async fn backlog_flows_through_bounded_window() {
        let queue = Arc::new(RamClientQueue::new());
        let client = ClientId::from("sub");
        for i in 0..5u8 {
            queue.add(&client, Publish::new("t", QoS::AtLeastOnce, Bytes::from(vec![i])));
        }
        let scx = ServerContext::builder(FlowConfig::default()).ram_queue(queue.clone()).build();
        let (transport, mut out) = ChannelTransport::pair();
        let conn = scx
            .start_session(ConnectInfo::new("sub", ProtocolVersion::V5).receive_maximum(2), Arc::new(transport))
            .unwrap();

        let mut received = Vec::new();
        let (first, _) = published_id(&next(&mut out).await);
        let (second, _) = published_id(&next(&mut out).await);
        received.extend([first, second]);
        assert!(out.try_recv().is_none());

        for _ in 0..3 {
            let oldest = received.remove(0);
            conn.incoming(Packet::PublishAck(PublishAck::new(oldest, PublishAckReason::Success))).unwrap();
            let (id, _) = published_id(&next(&mut out).await);
            received.push(id);
            assert!(out.try_recv().is_none());
        }
        for id in received {
            conn.incoming(Packet::PublishAck(PublishAck::new(id, PublishAckReason::Success))).unwrap();
        }
        eventually(|| queue.len(&client) == 0 && conn.inflight_count() == 0).await;
        eventually(|| conn.packet_ids().available() == 65535).await;
        assert_eq!(scx.stats.out_inflights.count(), 0);
    }

    #[tokio::test]
    async fn inbound_qos2_retransmission_dispatched_once() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let scx = ServerContext::builder(FlowConfig::default()).dispatcher(dispatcher.clone()).build();
        let (transport, mut out) = ChannelTransport::pair();
        let conn =
            scx.start_session(ConnectInfo::new("pub", ProtocolVersion::V5), Arc::new(transport)).unwrap();

        let publish = Publish::new("a", QoS::ExactlyOnce, Bytes::from_static(b"x")).packet_id(pid(7));
        let pubrec = Packet::PublishReceived(PublishAck::new(pid(7), PublishAckReason::Success));
        conn.incoming(Packet::Publish(Box::new(publish.clone()))).unwrap();
        assert_eq!(next(&mut out).await, pubrec);
        conn.incoming(Packet::Publish(Box::new(publish.clone().dup(true)))).unwrap();
        conn.incoming(Packet::Publish(Box::new(publish.dup(true)))).unwrap();
        assert_eq!(next(&mut out).await, pubrec);
        assert_eq!(next(&mut out).await, pubrec);
        assert_eq!(dispatcher.received.lock().len(), 1);

        conn.incoming(Packet::PublishRelease(PublishAck2::new(pid(7), PublishAck2Reason::Success))).unwrap();
        assert_eq!(
            next(&mut out).await,
            Packet::PublishComplete(PublishAck2::new(pid(7), PublishAck2Reason::Success))
        );
        //the session handles packets in order, so the PUBREL flow is finished once this is acked
        let qos1 = Publish::new("a", QoS::AtLeastOnce, Bytes::from_static(b"y")).packet_id(pid(8));
        conn.incoming(Packet::Publish(Box::new(qos1))).unwrap();
        assert_eq!(next(&mut out).await, Packet::PublishAck(PublishAck::new(pid(8), PublishAckReason::Success)));
        let client = ClientId::from("pub");
        assert_eq!(scx.flow_records.get(&client, pid(7)).await.unwrap(), None);
        assert_eq!(dispatcher.received.lock().len(), 2);
    }

    #[tokio::test]
    async fn second_connect_for_same_client_is_refused() {
        let scx = ServerContext::builder(FlowConfig::default()).build();
        let (a, _a_out) = ChannelTransport::pair();
        let (b, _b_out) = ChannelTransport::pair();
        let first = scx.start_session(ConnectInfo::new("x", ProtocolVersion::V5), Arc::new(a)).unwrap();
        let existing = scx.start_session(ConnectInfo::new("x", ProtocolVersion::V5), Arc::new(b)).unwrap_err();
        assert!(Arc::ptr_eq(&first, &existing));
        assert_eq!(scx.registry.len(), 1);
    }

    #[tokio::test]
    async fn unacknowledged_messages_resent_on_reconnect() {
        let queue = Arc::new(RamClientQueue::new());
        let client = ClientId::from("sub");
        queue.add(&client, Publish::new("t", QoS::AtLeastOnce, Bytes::from_static(b"1")));
        queue.add(&client, Publish::new("t", QoS::AtLeastOnce, Bytes::from_static(b"2")));
        let scx = ServerContext::builder(FlowConfig::default()).ram_queue(queue.clone()).build();
        let info = ConnectInfo::new("sub", ProtocolVersion::V5).receive_maximum(1).session_expiry_interval(60);

        let (transport, mut out) = ChannelTransport::pair();
        let conn = scx.start_session(info.clone(), Arc::new(transport)).unwrap();
        let (first, dup) = published_id(&next(&mut out).await);
        assert!(!dup);
        out.close();
        tokio::time::timeout(Duration::from_secs(5), conn.closed().wait()).await.unwrap();
        assert!(scx.registry.is_empty());
        eventually(|| conn.inflight_count() == 0).await;
        assert_eq!(queue.len(&client), 2);

        let (transport, mut out) = ChannelTransport::pair();
        let conn = scx.start_session(info, Arc::new(transport)).unwrap();
        let (resent, dup) = published_id(&next(&mut out).await);
        assert_eq!(resent, first);
        assert!(dup);
        conn.incoming(Packet::PublishAck(PublishAck::new(resent, PublishAckReason::Success))).unwrap();
        let (second, dup) = published_id(&next(&mut out).await);
        assert!(!dup);
        conn.incoming(Packet::PublishAck(PublishAck::new(second, PublishAckReason::Success))).unwrap();
        eventually(|| queue.len(&client) == 0).await;
    }

    #[tokio::test]
    async fn duplicate_of_inflight_message_completes_flow_once() {
        let queue = Arc::new(RamClientQueue::new());
        let payloads = Arc::new(RamPayloadStore::new());
        let payload_id = payloads.add(Bytes::from_static(b"p"), 2);
        let client = ClientId::from("sub");
        queue.add(&client, Publish::new("t", QoS::AtLeastOnce, Bytes::from_static(b"p")).payload_id(payload_id));
        let scx =
            ServerContext::builder(FlowConfig::default()).payloads(payloads.clone()).ram_queue(queue.clone()).build();
        let (transport, mut out) = ChannelTransport::pair();
        let conn = scx.start_session(ConnectInfo::new("sub", ProtocolVersion::V5), Arc::new(transport)).unwrap();

        let publish = match next(&mut out).await {
            Packet::Publish(p) => *p,
            other => panic!("expected PUBLISH, got {:?}", other),
        };
        let id = publish.packet_id.unwrap();
        conn.deliver(publish.dup(true), DeliveryTarget::Client).unwrap();
        assert_eq!(published_id(&next(&mut out).await), (id, true));

        conn.incoming(Packet::PublishAck(PublishAck::new(id, PublishAckReason::Success))).unwrap();
        eventually(|| queue.len(&client) == 0 && conn.inflight_count() == 0).await;
        assert_eq!(payloads.reference_count(payload_id), Some(1));
        assert_eq!(conn.packet_ids().available(), 65535);
    }

    #[tokio::test]
    async fn disconnect_with_zero_expiry_deletes_flow_records() {
        let scx = ServerContext::builder(FlowConfig::default()).build();
        let (transport, mut out) = ChannelTransport::pair();
        let conn = scx.start_session(ConnectInfo::new("pub", ProtocolVersion::V5), Arc::new(transport)).unwrap();
        let publish = Publish::new("a", QoS::ExactlyOnce, Bytes::from_static(b"x")).packet_id(pid(3));
        conn.incoming(Packet::Publish(Box::new(publish))).unwrap();
        next(&mut out).await;
        let client = ClientId::from("pub");
        assert!(matches!(scx.flow_records.get(&client, pid(3)).await.unwrap(), Some(FlowRecord::Publish(_))));

        out.close();
        tokio::time::timeout(Duration::from_secs(5), conn.closed().wait()).await.unwrap();
        assert_eq!(scx.flow_records.get(&client, pid(3)).await.unwrap(), None);
        assert_eq!(scx.stats.in_inflights.count(), 0);
        assert_eq!(scx.stats.connections.count(), 0);
    }

    #[tokio::test]
    async fn shutdown_closes_live_sessions() {
        let scx = ServerContext::builder(FlowConfig { shutdown_partition_size: 2, ..FlowConfig::default() }).build();
        let mut conns = Vec::new();
        let mut outs = Vec::new();
        for i in 0..5 {
            let (transport, out) = ChannelTransport::pair();
            conns.push(scx.start_session(ConnectInfo::new(format!("c{}", i), ProtocolVersion::V5), Arc::new(transport)).unwrap());
            outs.push(out);
        }
        let report = scx.registry.shutdown().await;
        assert_eq!(report.batches, 3);
        assert_eq!(report.connections, 5);
        for c in &conns {
            tokio::time::timeout(Duration::from_secs(5), c.closed().wait()).await.unwrap();
        }
        assert!(scx.registry.is_empty());
    }
}
