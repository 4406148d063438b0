use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use crate::completion::PublishCompletion;
use crate::error::ChannelClosed;
use crate::stats::Stats;
use crate::transport::Transport;
use crate::types::{ClientId, HashMap, Packet, PacketId, Publish, PublishAck2, PublishAck2Reason, PublishStatus, QoS};

/// A QoS 1/2 publish waiting for a free slot in the in-flight window.
pub struct QueuedMessage {
    pub publish: Publish,
    pub completion: PublishCompletion,
}

/// What `submit` did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Written,
    Queued,
    /// A DUP resend of a packet id already in the window, written without taking a slot.
    Retransmitted,
    Rejected,
}

/// Result of completing a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlowCompletion {
    /// A completion handle was registered for the packet id and has been resolved.
    pub resolved: bool,
    /// The packet id occupied a window slot, the queue was drained afterwards.
    pub released: bool,
}

/// Outbound ordering for one connection.
///
/// Owned by the connection's session task. At most `max_inflight` QoS 1/2 publishes are
/// unacknowledged at any time, the rest wait in strict FIFO order.
pub struct OutboundOrderingEngine {
    client_id: ClientId,
    transport: Arc<dyn Transport>,
    max_inflight: usize,
    window: BTreeSet<PacketId>,
    queue: VecDeque<QueuedMessage>,
    completions: HashMap<PacketId, PublishCompletion>,
    closed: bool,
    stats: Arc<Stats>,
}

impl OutboundOrderingEngine {
    pub fn new(client_id: ClientId, transport: Arc<dyn Transport>, max_inflight: usize, stats: Arc<Stats>) -> Self {
        Self {
            client_id,
            transport,
            max_inflight: max_inflight.max(1),
            window: BTreeSet::new(),
            queue: VecDeque::new(),
            completions: HashMap::default(),
            closed: false,
            stats,
        }
    }

    pub fn submit(&mut self, publish: Publish, completion: PublishCompletion) -> Admission {
        if publish.qos == QoS::AtMostOnce {
            self.write(publish);
            completion.resolve(Ok(PublishStatus::Delivered));
            return Admission::Written;
        }

        if self.closed {
            completion.resolve(Err(ChannelClosed));
            return Admission::Rejected;
        }

        let packet_id = match publish.packet_id {
            Some(packet_id) => packet_id,
            None => {
                log::error!("{} QoS {} publish without packet id, {:?}", self.client_id, publish.qos.value(), publish);
                completion.resolve(Ok(PublishStatus::Failed));
                return Admission::Rejected;
            }
        };

        if self.is_retransmit(&publish) {
            log::debug!("{} retransmit packet id {}", self.client_id, packet_id);
            self.track(packet_id, completion);
            self.write(publish);
            return Admission::Retransmitted;
        }

        if self.window.len() < self.max_inflight {
            self.admit(packet_id, publish, completion);
            Admission::Written
        } else {
            self.stats.out_queued.inc();
            self.queue.push_back(QueuedMessage { publish, completion });
            Admission::Queued
        }
    }

    /// Resends a PUBREL for a flow admitted on an earlier connection. Never queued.
    pub fn submit_pubrel(&mut self, packet_id: PacketId, completion: PublishCompletion) -> Admission {
        if self.closed {
            completion.resolve(Ok(PublishStatus::NotConnected));
            return Admission::Rejected;
        }
        self.track(packet_id, completion);
        self.write_pubrel(packet_id, PublishAck2Reason::Success);
        Admission::Written
    }

    /// Writes the PUBREL continuing a QoS 2 flow. The flow's handle stays registered
    /// and is resolved by the PUBCOMP.
    #[inline]
    pub fn write_pubrel(&self, packet_id: PacketId, reason_code: PublishAck2Reason) {
        let _ = self.transport.write(Packet::PublishRelease(PublishAck2::new(packet_id, reason_code)));
    }

    /// PUBACK, PUBCOMP or a final PUBREC arrived for `packet_id`.
    #[inline]
    pub fn on_flow_complete(&mut self, packet_id: PacketId) -> FlowCompletion {
        self.complete_flow(packet_id, PublishStatus::Delivered)
    }

    /// The client ended the flow with an error reason code.
    #[inline]
    pub fn on_flow_failed(&mut self, packet_id: PacketId) -> FlowCompletion {
        self.complete_flow(packet_id, PublishStatus::Failed)
    }

    pub fn on_channel_inactive(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let queued = self.queue.len();
        for m in self.queue.drain(..) {
            m.completion.resolve(Err(ChannelClosed));
        }
        self.stats.out_queued.decs(queued as isize);

        self.stats.out_inflights.decs(self.window.len() as isize);
        self.window.clear();
        for (_, completion) in self.completions.drain() {
            completion.resolve(Ok(PublishStatus::NotConnected));
        }
        log::debug!("{} channel inactive, {} queued messages abandoned", self.client_id, queued);
    }

    /// A DUP resend of a packet id already in the window. Written on submit without
    /// taking a slot, the handle registered at admission keeps tracking the flow.
    #[inline]
    pub fn is_retransmit(&self, publish: &Publish) -> bool {
        publish.dup && publish.packet_id.map_or(false, |id| self.window.contains(&id))
    }

    #[inline]
    pub fn is_tracked(&self, packet_id: PacketId) -> bool {
        self.window.contains(&packet_id) || self.completions.contains_key(&packet_id)
    }

    #[inline]
    pub fn inflight_len(&self) -> usize {
        self.window.len()
    }

    #[inline]
    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn max_inflight(&self) -> usize {
        self.max_inflight
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    #[inline]
    pub fn window(&self) -> impl Iterator<Item = &PacketId> {
        self.window.iter()
    }

    fn complete_flow(&mut self, packet_id: PacketId, status: PublishStatus) -> FlowCompletion {
        let resolved = match self.completions.remove(&packet_id) {
            Some(completion) => {
                completion.resolve(Ok(status));
                true
            }
            None => false,
        };
        if !self.window.remove(&packet_id) {
            return FlowCompletion { resolved, released: false };
        }
        self.stats.out_inflights.dec();
        self.drain();
        FlowCompletion { resolved, released: true }
    }

    fn drain(&mut self) {
        while self.window.len() < self.max_inflight {
            let m = match self.queue.pop_front() {
                Some(m) => m,
                None => break,
            };
            self.stats.out_queued.dec();
            match m.publish.packet_id {
                Some(packet_id) => self.admit(packet_id, m.publish, m.completion),
                None => {
                    m.completion.resolve(Ok(PublishStatus::Failed));
                }
            }
        }
    }

    #[inline]
    fn admit(&mut self, packet_id: PacketId, publish: Publish, completion: PublishCompletion) {
        if self.window.insert(packet_id) {
            self.stats.out_inflights.inc();
        }
        self.track(packet_id, completion);
        self.write(publish);
    }

    /// A second handle for a packet id already tracked follows the first one.
    fn track(&mut self, packet_id: PacketId, completion: PublishCompletion) {
        match self.completions.get(&packet_id) {
            Some(existing) if existing.ptr_eq(&completion) => {}
            Some(existing) => existing.on_complete(move |res| {
                completion.resolve(*res);
            }),
            None => {
                self.completions.insert(packet_id, completion);
            }
        }
    }

    #[inline]
    fn write(&self, publish: Publish) {
        let _ = self.transport.write(Packet::Publish(Box::new(publish)));
    }
}
