use std::collections::VecDeque;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ClientId, DashMap, HashSet, PacketId, Publish, QoS, QueueId, UniqueId};

/// Message queues consulted when an outbound flow completes.
#[async_trait]
pub trait ClientQueue: Sync + Send {
    /// Removes the entry of a per client queue that was sent with `packet_id`.
    async fn remove(&self, client_id: &ClientId, packet_id: PacketId) -> Result<()>;

    /// Removes a message from a shared subscription queue.
    async fn remove_shared(&self, queue_id: &QueueId, unique_id: &UniqueId) -> Result<()>;

    /// Makes a claimed shared subscription message claimable by other group members again.
    async fn remove_inflight_marker(&self, queue_id: &QueueId, unique_id: &UniqueId) -> Result<()>;

    /// Replaces the sent PUBLISH of a QoS 2 flow with a PUBREL marker.
    async fn put_pubrel(&self, client_id: &ClientId, packet_id: PacketId) -> Result<()>;

    /// Returns the entry sent with `packet_id` to the unsent state. Used for messages
    /// that never reached the wire, they are read again as new messages.
    async fn mark_unsent(&self, client_id: &ClientId, packet_id: PacketId) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resend {
    Publish(Publish),
    Pubrel(PacketId),
}

#[derive(Debug)]
enum Entry {
    Publish { publish: Publish, sent: bool },
    Pubrel(PacketId),
}

impl Entry {
    #[inline]
    fn packet_id(&self) -> Option<PacketId> {
        match self {
            Entry::Publish { publish, sent: true } => publish.packet_id,
            Entry::Publish { sent: false, .. } => None,
            Entry::Pubrel(packet_id) => Some(*packet_id),
        }
    }
}

#[derive(Debug, Default)]
struct SharedQueue {
    messages: VecDeque<Publish>,
    inflight: HashSet<UniqueId>,
}

/// In memory per client and shared subscription queues.
#[derive(Default)]
pub struct RamClientQueue {
    clients: DashMap<ClientId, VecDeque<Entry>>,
    shared: DashMap<QueueId, SharedQueue>,
    memberships: DashMap<ClientId, Vec<QueueId>>,
}

impl RamClientQueue {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, client_id: &ClientId, publish: Publish) {
        self.clients.entry(client_id.clone()).or_default().push_back(Entry::Publish { publish, sent: false });
    }

    pub fn add_shared(&self, queue_id: &QueueId, publish: Publish) {
        self.shared.entry(queue_id.clone()).or_default().messages.push_back(publish);
    }

    pub fn join_shared(&self, client_id: &ClientId, queue_id: &QueueId) {
        let mut queues = self.memberships.entry(client_id.clone()).or_default();
        if !queues.contains(queue_id) {
            queues.push(queue_id.clone());
        }
    }

    #[inline]
    pub fn shared_queues_of(&self, client_id: &ClientId) -> Vec<QueueId> {
        self.memberships.get(client_id).map(|q| q.value().clone()).unwrap_or_default()
    }

    /// Entries sent on a previous connection, in queue order. Publishes are marked DUP.
    pub fn read_inflight(&self, client_id: &ClientId) -> Vec<Resend> {
        let entries = match self.clients.get(client_id) {
            Some(entries) => entries,
            None => return Vec::new(),
        };
        entries
            .iter()
            .filter_map(|e| match e {
                Entry::Publish { publish, sent: true } => Some(Resend::Publish(publish.clone().dup(true))),
                Entry::Pubrel(packet_id) => Some(Resend::Pubrel(*packet_id)),
                Entry::Publish { sent: false, .. } => None,
            })
            .collect()
    }

    /// Up to `max` unsent messages. QoS 0 messages leave the queue, the others get a
    /// packet id from `assign` and stay until their flow completes.
    pub fn read_new<F>(&self, client_id: &ClientId, max: usize, mut assign: F) -> Vec<Publish>
    where
        F: FnMut() -> Option<PacketId>,
    {
        let mut out = Vec::new();
        let mut entries = match self.clients.get_mut(client_id) {
            Some(entries) => entries,
            None => return out,
        };
        let mut i = 0;
        while i < entries.len() && out.len() < max {
            let (unsent, qos0) = match &entries[i] {
                Entry::Publish { publish, sent } => (!*sent, publish.qos == QoS::AtMostOnce),
                Entry::Pubrel(_) => (false, false),
            };
            if !unsent {
                i += 1;
                continue;
            }
            if qos0 {
                if let Some(Entry::Publish { publish, .. }) = entries.remove(i) {
                    out.push(publish);
                }
                continue;
            }
            let packet_id = match assign() {
                Some(packet_id) => packet_id,
                None => break,
            };
            if let Entry::Publish { publish, sent } = &mut entries[i] {
                publish.packet_id = Some(packet_id);
                *sent = true;
                out.push(publish.clone());
            }
            i += 1;
        }
        out
    }

    /// Claims up to `max` messages of a shared queue that no group member holds.
    pub fn read_shared(&self, queue_id: &QueueId, max: usize) -> Vec<Publish> {
        let mut queue = match self.shared.get_mut(queue_id) {
            Some(queue) => queue,
            None => return Vec::new(),
        };
        let SharedQueue { messages, inflight } = &mut *queue;
        let mut out = Vec::new();
        for publish in messages.iter() {
            if out.len() >= max {
                break;
            }
            if inflight.insert(publish.unique_id.clone()) {
                out.push(publish.clone());
            }
        }
        out
    }

    /// Drops the claim on a shared message without removing it.
    #[inline]
    pub fn release_claim(&self, queue_id: &QueueId, unique_id: &UniqueId) {
        if let Some(mut queue) = self.shared.get_mut(queue_id) {
            queue.inflight.remove(unique_id);
        }
    }

    pub fn unsend(&self, client_id: &ClientId, packet_id: PacketId) {
        let mut entries = match self.clients.get_mut(client_id) {
            Some(entries) => entries,
            None => return,
        };
        if let Some(Entry::Publish { publish, sent }) =
            entries.iter_mut().find(|e| e.packet_id() == Some(packet_id))
        {
            publish.packet_id = None;
            *sent = false;
        }
    }

    #[inline]
    pub fn len(&self, client_id: &ClientId) -> usize {
        self.clients.get(client_id).map(|e| e.len()).unwrap_or_default()
    }

    #[inline]
    pub fn shared_len(&self, queue_id: &QueueId) -> usize {
        self.shared.get(queue_id).map(|q| q.messages.len()).unwrap_or_default()
    }

    #[inline]
    pub fn shared_inflight(&self, queue_id: &QueueId) -> usize {
        self.shared.get(queue_id).map(|q| q.inflight.len()).unwrap_or_default()
    }
}

#[async_trait]
impl ClientQueue for RamClientQueue {
    async fn remove(&self, client_id: &ClientId, packet_id: PacketId) -> Result<()> {
        if let Some(mut entries) = self.clients.get_mut(client_id) {
            if let Some(pos) = entries.iter().position(|e| e.packet_id() == Some(packet_id)) {
                entries.remove(pos);
            }
        }
        Ok(())
    }

    async fn remove_shared(&self, queue_id: &QueueId, unique_id: &UniqueId) -> Result<()> {
        if let Some(mut queue) = self.shared.get_mut(queue_id) {
            queue.inflight.remove(unique_id);
            queue.messages.retain(|p| &p.unique_id != unique_id);
        }
        Ok(())
    }

    async fn remove_inflight_marker(&self, queue_id: &QueueId, unique_id: &UniqueId) -> Result<()> {
        self.release_claim(queue_id, unique_id);
        Ok(())
    }

    async fn put_pubrel(&self, client_id: &ClientId, packet_id: PacketId) -> Result<()> {
        let mut entries = self.clients.entry(client_id.clone()).or_default();
        match entries.iter().position(|e| e.packet_id() == Some(packet_id)) {
            Some(pos) => entries[pos] = Entry::Pubrel(packet_id),
            None => entries.push_back(Entry::Pubrel(packet_id)),
        }
        Ok(())
    }

    async fn mark_unsent(&self, client_id: &ClientId, packet_id: PacketId) -> Result<()> {
        self.unsend(client_id, packet_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn pid(v: u16) -> PacketId {
        PacketId::new(v).unwrap()
    }

    fn publish(qos: QoS) -> Publish {
        Publish::new("t", qos, Bytes::from_static(b"p"))
    }

    #[tokio::test]
    async fn read_new_assigns_ids_and_drops_qos0() {
        let q = RamClientQueue::new();
        let c = ClientId::from("c");
        q.add(&c, publish(QoS::AtLeastOnce));
        q.add(&c, publish(QoS::AtMostOnce));
        q.add(&c, publish(QoS::ExactlyOnce));
        q.add(&c, publish(QoS::AtLeastOnce));
        let mut next = 0;
        let out = q.read_new(&c, 3, || {
            next += 1;
            PacketId::new(next)
        });
        assert_eq!(out.len(), 3);
        assert_eq!(out[0].packet_id, Some(pid(1)));
        assert_eq!(out[1].packet_id, None);
        assert_eq!(out[2].packet_id, Some(pid(2)));
        assert_eq!(q.len(&c), 3);
        assert!(q.read_new(&c, 10, || None).is_empty());

        q.put_pubrel(&c, pid(2)).await.unwrap();
        q.remove(&c, pid(1)).await.unwrap();
        assert_eq!(q.read_inflight(&c), vec![Resend::Pubrel(pid(2))]);
        assert_eq!(q.len(&c), 2);
    }

    #[tokio::test]
    async fn sent_messages_are_resent_as_duplicates() {
        let q = RamClientQueue::new();
        let c = ClientId::from("c");
        q.add(&c, publish(QoS::AtLeastOnce));
        let sent = q.read_new(&c, 10, || PacketId::new(5));
        let resend = q.read_inflight(&c);
        assert_eq!(resend, vec![Resend::Publish(sent[0].clone().dup(true))]);
    }

    #[tokio::test]
    async fn shared_marker_controls_claims() {
        let q = RamClientQueue::new();
        let g = QueueId::from("$share/g/t");
        let m = publish(QoS::AtLeastOnce);
        q.add_shared(&g, m.clone());
        assert_eq!(q.read_shared(&g, 10).len(), 1);
        assert!(q.read_shared(&g, 10).is_empty());
        q.remove_inflight_marker(&g, &m.unique_id).await.unwrap();
        assert_eq!(q.read_shared(&g, 10).len(), 1);
        q.remove_shared(&g, &m.unique_id).await.unwrap();
        assert_eq!(q.shared_len(&g), 0);
        assert_eq!(q.shared_inflight(&g), 0);
    }

    #[tokio::test]
    async fn unsent_entry_is_read_as_new_again() {
        let q = RamClientQueue::new();
        let c = ClientId::from("c");
        q.add(&c, publish(QoS::AtLeastOnce));
        q.add(&c, publish(QoS::AtLeastOnce));
        q.read_new(&c, 10, {
            let mut n = 0;
            move || {
                n += 1;
                PacketId::new(n)
            }
        });
        q.mark_unsent(&c, pid(2)).await.unwrap();
        assert_eq!(q.read_inflight(&c).len(), 1);
        let again = q.read_new(&c, 10, || PacketId::new(7));
        assert_eq!(again.len(), 1);
        assert!(!again[0].dup);
        assert_eq!(again[0].packet_id, Some(pid(7)));
        assert_eq!(q.len(&c), 2);
    }
}
