use std::sync::Arc;

use crate::connection::ClientConnection;
use crate::delivery::DeliveryTarget;
use crate::error::MqttError;
use crate::queue::{RamClientQueue, Resend};
use crate::types::{ClientId, Publish, QoS, QueueId};

/// Invoked when a connection has no outbound deliveries left in flight.
pub trait PollService: Sync + Send {
    fn poll_messages(&self, client_id: &ClientId, conn: &Arc<ClientConnection>);
}

/// Feeds a connection from a [`RamClientQueue`].
///
/// Order per poll: entries sent on an earlier connection, then new messages of the
/// client's own queue, then claimable messages of its shared subscription queues.
pub struct QueuePoller {
    queue: Arc<RamClientQueue>,
    batch_size: usize,
}

impl QueuePoller {
    #[inline]
    pub fn new(queue: Arc<RamClientQueue>, batch_size: usize) -> Self {
        Self { queue, batch_size: batch_size.max(1) }
    }

    fn poll_inflight(&self, client_id: &ClientId, conn: &Arc<ClientConnection>) -> usize {
        let resend = self.queue.read_inflight(client_id);
        let count = resend.len();
        for entry in resend {
            let res = match entry {
                Resend::Publish(publish) => {
                    if let Some(packet_id) = publish.packet_id {
                        claim(conn, packet_id);
                    }
                    conn.deliver(publish, DeliveryTarget::Client)
                }
                Resend::Pubrel(packet_id) => {
                    claim(conn, packet_id);
                    conn.resend_pubrel(packet_id)
                }
            };
            if res.is_err() {
                log::debug!("{} connection closed while resending in-flight messages", client_id);
                break;
            }
        }
        count
    }

    fn poll_new(&self, client_id: &ClientId, conn: &Arc<ClientConnection>) -> usize {
        let publishs = self.queue.read_new(client_id, self.batch_size, || conn.packet_ids().allocate().ok());
        let count = publishs.len();
        let mut publishs = publishs.into_iter();
        while let Some(publish) = publishs.next() {
            let packet_id = publish.packet_id;
            if conn.deliver(publish, DeliveryTarget::Client).is_err() {
                log::debug!("{} connection closed while handing over new messages", client_id);
                for packet_id in packet_id.into_iter().chain(publishs.filter_map(|p| p.packet_id)) {
                    self.queue.unsend(client_id, packet_id);
                    conn.packet_ids().release(packet_id);
                }
                break;
            }
        }
        count
    }

    fn poll_shared(&self, client_id: &ClientId, conn: &Arc<ClientConnection>) -> usize {
        let mut count = 0;
        for queue_id in self.queue.shared_queues_of(client_id) {
            let mut claimed = self.queue.read_shared(&queue_id, self.batch_size - count).into_iter();
            while let Some(mut publish) = claimed.next() {
                if publish.qos > QoS::AtMostOnce {
                    match conn.packet_ids().allocate() {
                        Ok(packet_id) => publish.packet_id = Some(packet_id),
                        Err(e) => {
                            log::warn!("{} {}, shared message {} left for other members", client_id, e, publish.unique_id);
                            self.release_claims(&queue_id, std::iter::once(publish).chain(claimed));
                            return count;
                        }
                    }
                }
                let (packet_id, unique_id) = (publish.packet_id, publish.unique_id.clone());
                if conn.deliver(publish, DeliveryTarget::Shared(queue_id.clone())).is_err() {
                    log::debug!("{} connection closed while handing over shared messages", client_id);
                    if let Some(packet_id) = packet_id {
                        conn.packet_ids().release(packet_id);
                    }
                    self.queue.release_claim(&queue_id, &unique_id);
                    self.release_claims(&queue_id, claimed);
                    return count;
                }
                count += 1;
            }
            if count >= self.batch_size {
                break;
            }
        }
        count
    }

    #[inline]
    fn release_claims(&self, queue_id: &QueueId, publishs: impl Iterator<Item = Publish>) {
        for publish in publishs {
            self.queue.release_claim(queue_id, &publish.unique_id);
        }
    }
}

impl PollService for QueuePoller {
    fn poll_messages(&self, client_id: &ClientId, conn: &Arc<ClientConnection>) {
        if !conn.is_open() {
            return;
        }
        if self.poll_inflight(client_id, conn) > 0 {
            return;
        }
        if self.poll_new(client_id, conn) > 0 {
            return;
        }
        let shared = self.poll_shared(client_id, conn);
        log::trace!("{} polled {} shared messages", client_id, shared);
    }
}

#[inline]
fn claim(conn: &ClientConnection, packet_id: crate::types::PacketId) {
    match conn.packet_ids().take_specific(packet_id) {
        Ok(()) | Err(MqttError::PacketIdInUse(_)) => {}
        Err(e) => log::warn!("{} {}", conn.id(), e),
    }
}
