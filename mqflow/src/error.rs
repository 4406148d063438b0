use std::num::NonZeroU16;

pub type Error = anyhow::Error;
pub type Result<T> = anyhow::Result<T, Error>;

/// Returned by every write on a transport that is no longer open, and by flows
/// abandoned when the channel went away. Carries no context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
#[error("channel closed")]
pub struct ChannelClosed;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MqttError {
    #[error("no free packet identifier")]
    PacketIdExhausted,
    #[error("packet identifier {0} is in use")]
    PacketIdInUse(NonZeroU16),
    #[error("invalid {0} value: {1}")]
    InvalidValue(&'static str, u8),
    #[error("protocol violation, {0}")]
    ProtocolViolation(String),
    #[error("storage error, {0}")]
    Storage(String),
    #[error("{0}")]
    ChannelClosed(#[from] ChannelClosed),
    #[error("service unavailable")]
    ServiceUnavailable,
}

impl MqttError {
    /// Routine failures that are resolved by the client reconnecting.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, MqttError::ChannelClosed(_) | MqttError::ServiceUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_channel_is_transient() {
        let e: MqttError = ChannelClosed.into();
        assert!(e.is_transient());
        assert_eq!(e.to_string(), "channel closed");
        assert!(!MqttError::PacketIdExhausted.is_transient());
        assert_eq!(std::mem::size_of::<ChannelClosed>(), 0);
    }
}
