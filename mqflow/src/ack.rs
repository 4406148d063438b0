use std::sync::Arc;

use crate::connection::ClientConnection;
use crate::inflight::{FlowCompletion, OutboundOrderingEngine};
use crate::queue::ClientQueue;
use crate::types::{PacketId, PublishAck, PublishAck2, PublishAck2Reason};

/// Client acknowledgments of the broker's outbound QoS 1/2 publishes.
pub struct OutboundAckCoordinator {
    conn: Arc<ClientConnection>,
    queue: Arc<dyn ClientQueue>,
}

impl OutboundAckCoordinator {
    #[inline]
    pub fn new(conn: Arc<ClientConnection>, queue: Arc<dyn ClientQueue>) -> Self {
        Self { conn, queue }
    }

    pub fn on_puback(&self, engine: &mut OutboundOrderingEngine, ack: PublishAck) {
        let done = engine.on_flow_complete(ack.packet_id);
        if !done.released && !done.resolved {
            log::debug!("{} PUBACK for unknown packet id {}", self.conn.id(), ack.packet_id);
        }
    }

    pub async fn on_pubrec(&self, engine: &mut OutboundOrderingEngine, ack: PublishAck) {
        let packet_id = ack.packet_id;
        if !ack.reason_code.continues_handshake() {
            log::debug!("{} PUBREC {} with reason {:?}, flow failed", self.conn.id(), packet_id, ack.reason_code);
            let done = engine.on_flow_failed(packet_id);
            self.release_untracked(packet_id, done);
            return;
        }

        if !engine.is_tracked(packet_id) {
            log::debug!("{} PUBREC for unknown packet id {}", self.conn.id(), packet_id);
            let reason_code = if self.conn.protocol().has_reason_codes() {
                PublishAck2Reason::PacketIdNotFound
            } else {
                PublishAck2Reason::Success
            };
            engine.write_pubrel(packet_id, reason_code);
            return;
        }

        if let Err(e) = self.queue.put_pubrel(self.conn.id(), packet_id).await {
            log::warn!("{} failed to persist PUBREL {}, {:?}", self.conn.id(), packet_id, e);
        }
        engine.write_pubrel(packet_id, PublishAck2Reason::Success);
    }

    pub fn on_pubcomp(&self, engine: &mut OutboundOrderingEngine, ack: PublishAck2) {
        let done = engine.on_flow_complete(ack.packet_id);
        self.release_untracked(ack.packet_id, done);
    }

    /// A resolved handle leaves the release to the completion pipeline. An id the
    /// engine never had in its window may still belong to a queued message.
    #[inline]
    fn release_untracked(&self, packet_id: PacketId, done: FlowCompletion) {
        match (done.released, done.resolved) {
            (true, false) => self.conn.packet_ids().release(packet_id),
            (false, false) => log::debug!("{} ack for unknown packet id {} ignored", self.conn.id(), packet_id),
            (_, true) => {}
        }
    }
}
