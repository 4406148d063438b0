use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{MqttError, Result};
use crate::types::{ClientId, DashMap, FlowRecord, HashMap, PacketId, PayloadId};

/// Durable per (client id, packet id) state of inbound QoS 1/2 flows.
///
/// Shared by all connections; implementations must be callable from any task.
#[async_trait]
pub trait FlowRecordStore: Sync + Send {
    async fn get(&self, client_id: &ClientId, packet_id: PacketId) -> Result<Option<FlowRecord>>;

    async fn put_or_replace(&self, client_id: &ClientId, packet_id: PacketId, record: FlowRecord) -> Result<()>;

    async fn remove(&self, client_id: &ClientId, packet_id: PacketId) -> Result<()>;

    async fn delete_all(&self, client_id: &ClientId) -> Result<()>;
}

#[derive(Default)]
pub struct RamFlowRecordStore {
    records: DashMap<ClientId, HashMap<PacketId, FlowRecord>>,
}

impl RamFlowRecordStore {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn count(&self, client_id: &ClientId) -> usize {
        self.records.get(client_id).map(|m| m.len()).unwrap_or_default()
    }
}

#[async_trait]
impl FlowRecordStore for RamFlowRecordStore {
    #[inline]
    async fn get(&self, client_id: &ClientId, packet_id: PacketId) -> Result<Option<FlowRecord>> {
        Ok(self.records.get(client_id).and_then(|m| m.get(&packet_id).cloned()))
    }

    #[inline]
    async fn put_or_replace(&self, client_id: &ClientId, packet_id: PacketId, record: FlowRecord) -> Result<()> {
        self.records.entry(client_id.clone()).or_default().insert(packet_id, record);
        Ok(())
    }

    async fn remove(&self, client_id: &ClientId, packet_id: PacketId) -> Result<()> {
        let empty = match self.records.get_mut(client_id) {
            Some(mut m) => {
                m.remove(&packet_id);
                m.is_empty()
            }
            None => false,
        };
        if empty {
            self.records.remove_if(client_id, |_, m| m.is_empty());
        }
        Ok(())
    }

    #[inline]
    async fn delete_all(&self, client_id: &ClientId) -> Result<()> {
        self.records.remove(client_id);
        Ok(())
    }
}

/// Reference counted payload storage shared by queue entries.
pub trait PayloadStore: Sync + Send {
    fn decrement_reference_count(&self, payload_id: PayloadId) -> Result<()>;
}

#[derive(Default)]
pub struct RamPayloadStore {
    next_id: AtomicU64,
    payloads: DashMap<PayloadId, (Bytes, usize)>,
}

impl RamPayloadStore {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a payload referenced by `references` queue entries.
    pub fn add(&self, payload: Bytes, references: usize) -> PayloadId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.payloads.insert(id, (payload, references));
        id
    }

    pub fn increment_reference_count(&self, payload_id: PayloadId) -> Result<()> {
        let mut entry = self
            .payloads
            .get_mut(&payload_id)
            .ok_or_else(|| anyhow!(MqttError::Storage(format!("payload {} not found", payload_id))))?;
        entry.1 += 1;
        Ok(())
    }

    #[inline]
    pub fn get(&self, payload_id: PayloadId) -> Option<Bytes> {
        self.payloads.get(&payload_id).map(|e| e.0.clone())
    }

    #[inline]
    pub fn reference_count(&self, payload_id: PayloadId) -> Option<usize> {
        self.payloads.get(&payload_id).map(|e| e.1)
    }
}

impl PayloadStore for RamPayloadStore {
    fn decrement_reference_count(&self, payload_id: PayloadId) -> Result<()> {
        let released = match self.payloads.get_mut(&payload_id) {
            Some(mut entry) => {
                entry.1 = entry.1.saturating_sub(1);
                entry.1 == 0
            }
            None => return Err(anyhow!(MqttError::Storage(format!("payload {} not found", payload_id)))),
        };
        if released {
            self.payloads.remove_if(&payload_id, |_, e| e.1 == 0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Publish, QoS};

    fn pid(v: u16) -> PacketId {
        PacketId::new(v).unwrap()
    }

    #[tokio::test]
    async fn records_are_scoped_per_client() {
        let store = RamFlowRecordStore::new();
        let a = ClientId::from("a");
        let b = ClientId::from("b");
        let publish = Publish::new("t", QoS::AtLeastOnce, Bytes::new()).packet_id(pid(1));
        store.put_or_replace(&a, pid(1), FlowRecord::Publish(Box::new(publish))).await.unwrap();
        store.put_or_replace(&b, pid(1), FlowRecord::Pubrel(pid(1))).await.unwrap();
        store.put_or_replace(&a, pid(1), FlowRecord::Pubrel(pid(1))).await.unwrap();
        assert_eq!(store.get(&a, pid(1)).await.unwrap(), Some(FlowRecord::Pubrel(pid(1))));
        assert_eq!(store.count(&a), 1);

        store.remove(&a, pid(1)).await.unwrap();
        assert_eq!(store.get(&a, pid(1)).await.unwrap(), None);
        assert_eq!(store.count(&b), 1);
        store.delete_all(&b).await.unwrap();
        assert_eq!(store.count(&b), 0);
    }

    #[test]
    fn payload_released_at_zero_references() {
        let store = RamPayloadStore::new();
        let id = store.add(Bytes::from_static(b"data"), 2);
        store.increment_reference_count(id).unwrap();
        store.decrement_reference_count(id).unwrap();
        store.decrement_reference_count(id).unwrap();
        assert_eq!(store.reference_count(id), Some(1));
        store.decrement_reference_count(id).unwrap();
        assert_eq!(store.get(id), None);
        assert!(store.decrement_reference_count(id).is_err());
    }
}
