use std::convert::TryFrom;
use std::fmt;
use std::num::NonZeroU16;

use bytes::Bytes;
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

use mqflow_utils::{timestamp_millis, TimestampMillis};

use crate::error::MqttError;

pub type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;
pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
pub type HashSet<K> = std::collections::HashSet<K, ahash::RandomState>;

pub type ClientId = ByteString;
pub type TopicName = ByteString;
/// Identifies a message queue: a client id, or the name of a shared subscription queue.
pub type QueueId = ByteString;
pub type UniqueId = ByteString;
pub type PacketId = NonZeroU16;
pub type PayloadId = u64;
pub type ReceiveMaximum = u16;
pub type SessionExpiryInterval = u32;

/// Session expiry interval meaning the session ends with the network connection.
pub const SESSION_EXPIRE_ON_DISCONNECT: SessionExpiryInterval = 0;

macro_rules! prim_enum {
    (
        $( #[$enum_attr:meta] )*
        pub enum $name:ident {
            $(
                $( #[$enum_item_attr:meta] )*
                $var:ident = $val:literal
            ),+
        }) => {
        $( #[$enum_attr] )*
        #[repr(u8)]
        #[derive(Debug, Eq, PartialEq, Copy, Clone, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                $( #[$enum_item_attr] )*
                $var = $val
            ),+
        }

        impl TryFrom<u8> for $name {
            type Error = MqttError;
            fn try_from(v: u8) -> Result<Self, Self::Error> {
                match v {
                    $($val => Ok($name::$var)),+
                    ,_ => Err(MqttError::InvalidValue(stringify!($name), v))
                }
            }
        }

        impl From<$name> for u8 {
            #[inline]
            fn from(v: $name) -> Self {
                v as u8
            }
        }
    };
}

prim_enum! {
    /// Quality of Service
    #[derive(PartialOrd, Ord)]
    pub enum QoS {
        /// At most once delivery, no acknowledgment.
        AtMostOnce = 0,
        /// At least once delivery, acknowledged by PUBACK.
        AtLeastOnce = 1,
        /// Exactly once delivery, PUBREC / PUBREL / PUBCOMP handshake.
        ExactlyOnce = 2
    }
}

impl QoS {
    #[inline]
    pub fn value(&self) -> u8 {
        u8::from(*self)
    }

    #[inline]
    pub fn less_value(&self, qos: QoS) -> QoS {
        if *self < qos {
            *self
        } else {
            qos
        }
    }
}

prim_enum! {
    /// Reason code carried by PUBACK and PUBREC
    pub enum PublishAckReason {
        Success = 0,
        NoMatchingSubscribers = 16,
        UnspecifiedError = 128,
        ImplementationSpecificError = 131,
        NotAuthorized = 135,
        TopicNameInvalid = 144,
        PacketIdentifierInUse = 145,
        QuotaExceeded = 151,
        PayloadFormatInvalid = 153
    }
}

impl PublishAckReason {
    /// Whether a PUBREC with this reason continues the QoS 2 handshake.
    #[inline]
    pub fn continues_handshake(&self) -> bool {
        matches!(self, PublishAckReason::Success | PublishAckReason::NoMatchingSubscribers)
    }
}

prim_enum! {
    /// Reason code carried by PUBREL and PUBCOMP
    pub enum PublishAck2Reason {
        Success = 0,
        PacketIdNotFound = 146
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolVersion {
    V3,
    V3_1_1,
    V5,
}

impl ProtocolVersion {
    /// Reason codes on acknowledgments are only transmitted from v5 on.
    #[inline]
    pub fn has_reason_codes(&self) -> bool {
        matches!(self, ProtocolVersion::V5)
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publish {
    pub dup: bool,
    pub retain: bool,
    pub qos: QoS,
    pub topic: TopicName,
    /// Present for QoS 1 and 2 only.
    pub packet_id: Option<PacketId>,
    pub payload: Bytes,
    /// Reference into the payload store when the payload is shared between queue entries.
    pub payload_id: Option<PayloadId>,
    /// Stable across redistribution to other shared subscription members.
    pub unique_id: UniqueId,
    pub create_time: TimestampMillis,
}

impl Publish {
    pub fn new<T: Into<TopicName>>(topic: T, qos: QoS, payload: Bytes) -> Self {
        Self {
            dup: false,
            retain: false,
            qos,
            topic: topic.into(),
            packet_id: None,
            payload,
            payload_id: None,
            unique_id: ByteString::from(uuid::Uuid::new_v4().simple().to_string()),
            create_time: timestamp_millis(),
        }
    }

    #[inline]
    pub fn packet_id(mut self, packet_id: PacketId) -> Self {
        self.packet_id = Some(packet_id);
        self
    }

    #[inline]
    pub fn dup(mut self, dup: bool) -> Self {
        self.dup = dup;
        self
    }

    #[inline]
    pub fn payload_id(mut self, payload_id: PayloadId) -> Self {
        self.payload_id = Some(payload_id);
        self
    }
}

impl fmt::Debug for Publish {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Publish {{ topic: {}, qos: {}, packet_id: {:?}, dup: {}, retain: {}, unique_id: {}, payload: {}B }}",
            self.topic,
            self.qos.value(),
            self.packet_id,
            self.dup,
            self.retain,
            self.unique_id,
            self.payload.len()
        )
    }
}

/// PUBACK / PUBREC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishAck {
    pub packet_id: PacketId,
    pub reason_code: PublishAckReason,
}

impl PublishAck {
    #[inline]
    pub fn new(packet_id: PacketId, reason_code: PublishAckReason) -> Self {
        Self { packet_id, reason_code }
    }
}

/// PUBREL / PUBCOMP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishAck2 {
    pub packet_id: PacketId,
    pub reason_code: PublishAck2Reason,
}

impl PublishAck2 {
    #[inline]
    pub fn new(packet_id: PacketId, reason_code: PublishAck2Reason) -> Self {
        Self { packet_id, reason_code }
    }
}

/// The packets that take part in QoS flows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Publish(Box<Publish>),
    PublishAck(PublishAck),
    PublishReceived(PublishAck),
    PublishRelease(PublishAck2),
    PublishComplete(PublishAck2),
}

impl Packet {
    #[inline]
    pub fn packet_id(&self) -> Option<PacketId> {
        match self {
            Packet::Publish(p) => p.packet_id,
            Packet::PublishAck(ack) | Packet::PublishReceived(ack) => Some(ack.packet_id),
            Packet::PublishRelease(ack) | Packet::PublishComplete(ack) => Some(ack.packet_id),
        }
    }
}

/// Outcome of an outbound publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PublishStatus {
    InProgress,
    Delivered,
    NotConnected,
    Failed,
}

impl PublishStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PublishStatus::InProgress)
    }
}

/// Persisted state of an open inbound QoS 1/2 flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowRecord {
    Publish(Box<Publish>),
    Pubrel(PacketId),
}

impl FlowRecord {
    #[inline]
    pub fn is_pubrel(&self) -> bool {
        matches!(self, FlowRecord::Pubrel(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qos_wire_values() {
        assert_eq!(QoS::try_from(0).ok(), Some(QoS::AtMostOnce));
        assert_eq!(QoS::try_from(1).ok(), Some(QoS::AtLeastOnce));
        assert_eq!(QoS::try_from(2).ok(), Some(QoS::ExactlyOnce));
        assert_eq!(QoS::try_from(3), Err(MqttError::InvalidValue("QoS", 3)));
        assert_eq!(QoS::ExactlyOnce.value(), 2);
        assert_eq!(QoS::ExactlyOnce.less_value(QoS::AtLeastOnce), QoS::AtLeastOnce);
    }

    #[test]
    fn pubrec_reason_continues_only_on_success() {
        assert!(PublishAckReason::Success.continues_handshake());
        assert!(PublishAckReason::NoMatchingSubscribers.continues_handshake());
        assert!(!PublishAckReason::QuotaExceeded.continues_handshake());
        assert!(!PublishAckReason::try_from(135).map(|r| r.continues_handshake()).unwrap_or(true));
        assert!(PublishAckReason::try_from(1).is_err());
        assert_eq!(u8::from(PublishAck2Reason::PacketIdNotFound), 146);
    }

    #[test]
    fn publish_builder() {
        let id = PacketId::new(9).unwrap();
        let p = Publish::new("a/b", QoS::AtLeastOnce, Bytes::from_static(b"x")).packet_id(id).dup(true);
        assert_eq!(p.packet_id, Some(id));
        assert!(p.dup);
        assert_eq!(p.unique_id.len(), 32);
        assert_eq!(Packet::Publish(Box::new(p)).packet_id(), Some(id));
        assert!(!PublishStatus::InProgress.is_terminal());
    }
}
