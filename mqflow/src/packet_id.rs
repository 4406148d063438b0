use std::num::NonZeroU16;
use std::ops::Range;

use parking_lot::Mutex;

use crate::error::MqttError;
use crate::types::PacketId;

const MIN_ID: u32 = 1;
const END_ID: u32 = u16::MAX as u32 + 1;

/// Per connection allocator of outbound packet identifiers.
///
/// Free identifiers are kept as sorted, non-adjacent ranges, so a connection with
/// few messages in flight holds one or two ranges no matter how long it lives.
pub struct PacketIdPool {
    free: Mutex<Vec<Range<u32>>>,
}

impl Default for PacketIdPool {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdPool {
    #[inline]
    pub fn new() -> Self {
        Self { free: Mutex::new(vec![MIN_ID..END_ID]) }
    }

    /// Takes the lowest free identifier.
    pub fn allocate(&self) -> Result<PacketId, MqttError> {
        let mut free = self.free.lock();
        let first = free.first_mut().ok_or(MqttError::PacketIdExhausted)?;
        let id = first.start;
        first.start += 1;
        if first.is_empty() {
            free.remove(0);
        }
        to_packet_id(id).ok_or(MqttError::PacketIdExhausted)
    }

    /// Claims an exact identifier, for a message resent with the id it was first sent with.
    pub fn take_specific(&self, id: PacketId) -> Result<(), MqttError> {
        let v = id.get() as u32;
        let mut free = self.free.lock();
        let idx = free.partition_point(|r| r.end <= v);
        match free.get_mut(idx) {
            Some(r) if r.contains(&v) => {
                if r.start == v {
                    r.start += 1;
                    if r.is_empty() {
                        free.remove(idx);
                    }
                } else if r.end == v + 1 {
                    r.end -= 1;
                } else {
                    let upper = v + 1..r.end;
                    r.end = v;
                    free.insert(idx + 1, upper);
                }
                Ok(())
            }
            _ => Err(MqttError::PacketIdInUse(id)),
        }
    }

    /// Returns an identifier to the pool. Releasing a free identifier does nothing.
    pub fn release(&self, id: PacketId) {
        let v = id.get() as u32;
        let mut free = self.free.lock();
        let idx = free.partition_point(|r| r.end < v);
        let len = free.len();
        if idx < len && free[idx].end == v {
            free[idx].end += 1;
            if idx + 1 < len && free[idx + 1].start == free[idx].end {
                let next = free.remove(idx + 1);
                free[idx].end = next.end;
            }
        } else if idx < len && free[idx].contains(&v) {
            log::debug!("packet id {} released twice", v);
        } else if idx < len && free[idx].start == v + 1 {
            free[idx].start = v;
        } else {
            free.insert(idx, v..v + 1);
        }
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.free.lock().iter().map(|r| r.len()).sum()
    }
}

#[inline]
fn to_packet_id(v: u32) -> Option<PacketId> {
    u16::try_from(v).ok().and_then(NonZeroU16::new)
}
