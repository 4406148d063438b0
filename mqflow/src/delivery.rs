use std::sync::Arc;

use crate::completion::{Completion, DeliveryResult, PublishCompletion};
use crate::connection::ClientConnection;
use crate::poll::PollService;
use crate::queue::ClientQueue;
use crate::store::PayloadStore;
use crate::types::{PacketId, PayloadId, Publish, PublishStatus, QoS, QueueId, UniqueId};

/// The queue an outbound message was taken from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryTarget {
    /// The client's own queue, entries are keyed by packet id.
    Client,
    /// A shared subscription queue, entries are keyed by unique id.
    Shared(QueueId),
}

/// What the pipeline needs to know about a message once its flow ended.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub qos: QoS,
    pub packet_id: Option<PacketId>,
    pub payload_id: Option<PayloadId>,
    pub unique_id: UniqueId,
    pub dup: bool,
    pub target: DeliveryTarget,
}

impl Delivery {
    #[inline]
    pub fn new(publish: &Publish, target: DeliveryTarget) -> Self {
        Self {
            qos: publish.qos,
            packet_id: publish.packet_id,
            payload_id: publish.payload_id,
            unique_id: publish.unique_id.clone(),
            dup: publish.dup,
            target,
        }
    }
}

/// Turns the terminal status of an outbound flow into queue cleanup, payload
/// reference release, packet id release and the next poll.
pub struct DeliveryCompletionPipeline {
    payloads: Arc<dyn PayloadStore>,
    queue: Arc<dyn ClientQueue>,
    poll: Arc<dyn PollService>,
}

impl DeliveryCompletionPipeline {
    pub fn new(payloads: Arc<dyn PayloadStore>, queue: Arc<dyn ClientQueue>, poll: Arc<dyn PollService>) -> Self {
        Self { payloads, queue, poll }
    }

    /// Completion handle for a publish about to be submitted on `conn`.
    pub fn track(self: &Arc<Self>, conn: &Arc<ClientConnection>, publish: &Publish, target: DeliveryTarget) -> PublishCompletion {
        let completion = Completion::new();
        let pipeline = self.clone();
        let conn = conn.clone();
        let delivery = Delivery::new(publish, target);
        completion.on_complete(move |res: &DeliveryResult| {
            let res = *res;
            tokio::spawn(async move { pipeline.on_publish_complete(&conn, delivery, res).await });
        });
        completion
    }

    /// Completion handle for a PUBREL resent on a new connection.
    pub fn track_pubrel(self: &Arc<Self>, conn: &Arc<ClientConnection>, packet_id: PacketId) -> PublishCompletion {
        let completion = Completion::new();
        let pipeline = self.clone();
        let conn = conn.clone();
        completion.on_complete(move |res: &DeliveryResult| {
            let res = *res;
            tokio::spawn(async move { pipeline.on_pubrel_complete(&conn, packet_id, res).await });
        });
        completion
    }

    pub async fn on_publish_complete(&self, conn: &Arc<ClientConnection>, delivery: Delivery, res: DeliveryResult) {
        // A closed channel signal means the message never left the ordering queue, a
        // first attempt is then read again as new.
        let never_written = res.is_err() && !delivery.dup;
        let status = match terminal_status(conn, res) {
            Some(status) => status,
            None => return,
        };
        let client_id = conn.id();

        let removed = match (&delivery.target, status) {
            (DeliveryTarget::Shared(queue_id), PublishStatus::Delivered) => {
                let res = self.queue.remove_shared(queue_id, &delivery.unique_id).await;
                match (delivery.qos, delivery.packet_id) {
                    (QoS::ExactlyOnce, Some(packet_id)) => res.and(self.queue.remove(client_id, packet_id).await),
                    _ => res,
                }
            }
            (DeliveryTarget::Shared(queue_id), _) => {
                self.queue.remove_inflight_marker(queue_id, &delivery.unique_id).await
            }
            (DeliveryTarget::Client, PublishStatus::Delivered) | (DeliveryTarget::Client, PublishStatus::Failed) => {
                match delivery.packet_id {
                    Some(packet_id) => self.queue.remove(client_id, packet_id).await,
                    None => Ok(()),
                }
            }
            (DeliveryTarget::Client, _) => match delivery.packet_id {
                Some(packet_id) if never_written => self.queue.mark_unsent(client_id, packet_id).await,
                _ => Ok(()),
            },
        };
        if let Err(e) = removed {
            log::warn!("{} failed to clean up queue after {:?}, {:?}", client_id, status, e);
        }

        if let Some(payload_id) = delivery.payload_id {
            if let Err(e) = self.payloads.decrement_reference_count(payload_id) {
                log::warn!("{} {:?}", client_id, e);
            }
        }
        if delivery.qos > QoS::AtMostOnce {
            if let Some(packet_id) = delivery.packet_id {
                conn.packet_ids().release(packet_id);
            }
        }

        self.after_flow(conn, status);
    }

    pub async fn on_pubrel_complete(&self, conn: &Arc<ClientConnection>, packet_id: PacketId, res: DeliveryResult) {
        let status = match terminal_status(conn, res) {
            Some(status) => status,
            None => return,
        };
        if status != PublishStatus::NotConnected {
            if let Err(e) = self.queue.remove(conn.id(), packet_id).await {
                log::warn!("{} failed to remove PUBREL {} from queue, {:?}", conn.id(), packet_id, e);
            }
        }
        conn.packet_ids().release(packet_id);
        self.after_flow(conn, status);
    }

    #[inline]
    fn after_flow(&self, conn: &Arc<ClientConnection>, status: PublishStatus) {
        if conn.end_delivery() == 0 && status != PublishStatus::NotConnected {
            self.poll.poll_messages(conn.id(), conn);
        }
    }
}

#[inline]
fn terminal_status(conn: &ClientConnection, res: DeliveryResult) -> Option<PublishStatus> {
    match res {
        Ok(PublishStatus::InProgress) => {
            log::error!("{} flow completed with status IN_PROGRESS", conn.id());
            None
        }
        Ok(status) => Some(status),
        Err(_) => Some(PublishStatus::NotConnected),
    }
}
