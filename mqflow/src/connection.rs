use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::completion::Completion;
use crate::delivery::DeliveryTarget;
use crate::error::ChannelClosed;
use crate::packet_id::PacketIdPool;
use crate::session::SessionEvent;
use crate::transport::Transport;
use crate::types::{
    ClientId, Packet, PacketId, ProtocolVersion, Publish, ReceiveMaximum, SessionExpiryInterval,
    SESSION_EXPIRE_ON_DISCONNECT,
};

/// Negotiated parameters of an accepted CONNECT.
#[derive(Debug, Clone)]
pub struct ConnectInfo {
    pub client_id: ClientId,
    pub protocol: ProtocolVersion,
    pub receive_maximum: Option<ReceiveMaximum>,
    pub session_expiry_interval: SessionExpiryInterval,
}

impl ConnectInfo {
    pub fn new<C: Into<ClientId>>(client_id: C, protocol: ProtocolVersion) -> Self {
        Self {
            client_id: client_id.into(),
            protocol,
            receive_maximum: None,
            session_expiry_interval: SESSION_EXPIRE_ON_DISCONNECT,
        }
    }

    #[inline]
    pub fn receive_maximum(mut self, receive_maximum: ReceiveMaximum) -> Self {
        self.receive_maximum = Some(receive_maximum);
        self
    }

    #[inline]
    pub fn session_expiry_interval(mut self, interval: SessionExpiryInterval) -> Self {
        self.session_expiry_interval = interval;
        self
    }
}

/// A live client connection, shared between its session task, the registry and
/// the delivery pipeline. Mutable flow state lives in the session, not here.
pub struct ClientConnection {
    info: ConnectInfo,
    transport: Arc<dyn Transport>,
    packet_ids: PacketIdPool,
    inflight_count: AtomicUsize,
    graceful_disconnect: Mutex<Option<Completion<()>>>,
    closed: Completion<()>,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ClientConnection {
    pub(crate) fn new(
        info: ConnectInfo,
        transport: Arc<dyn Transport>,
        session_tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            info,
            transport,
            packet_ids: PacketIdPool::new(),
            inflight_count: AtomicUsize::new(0),
            graceful_disconnect: Mutex::new(None),
            closed: Completion::new(),
            session_tx,
        }
    }

    #[inline]
    pub fn id(&self) -> &ClientId {
        &self.info.client_id
    }

    #[inline]
    pub fn protocol(&self) -> ProtocolVersion {
        self.info.protocol
    }

    #[inline]
    pub fn session_expiry_interval(&self) -> SessionExpiryInterval {
        self.info.session_expiry_interval
    }

    #[inline]
    pub fn expire_on_disconnect(&self) -> bool {
        self.info.session_expiry_interval == SESSION_EXPIRE_ON_DISCONNECT
    }

    #[inline]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    #[inline]
    pub fn packet_ids(&self) -> &PacketIdPool {
        &self.packet_ids
    }

    /// `min(receive maximum, configured maximum)`, a missing or zero receive maximum
    /// means the configured maximum.
    #[inline]
    pub fn max_inflight_window(&self, configured: u16) -> usize {
        match self.info.receive_maximum {
            Some(rm) if rm > 0 => rm.min(configured) as usize,
            _ => configured as usize,
        }
    }

    /// Hands an outbound publish to the session task.
    pub fn deliver(&self, publish: Publish, target: DeliveryTarget) -> Result<(), ChannelClosed> {
        self.begin_delivery();
        self.session_tx.send(SessionEvent::Deliver(Box::new(publish), target)).map_err(|_| {
            self.end_delivery();
            ChannelClosed
        })
    }

    /// Resends the PUBREL of a QoS 2 flow whose PUBREC arrived on an earlier connection.
    pub fn resend_pubrel(&self, packet_id: PacketId) -> Result<(), ChannelClosed> {
        self.begin_delivery();
        self.session_tx.send(SessionEvent::ResendPubrel(packet_id)).map_err(|_| {
            self.end_delivery();
            ChannelClosed
        })
    }

    /// Feeds a packet read from the network into the session.
    #[inline]
    pub fn incoming(&self, packet: Packet) -> Result<(), ChannelClosed> {
        self.session_tx.send(SessionEvent::Incoming(packet)).map_err(|_| ChannelClosed)
    }

    #[inline]
    pub fn inflight_count(&self) -> usize {
        self.inflight_count.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn begin_delivery(&self) {
        self.inflight_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns the number of deliveries still outstanding.
    pub(crate) fn end_delivery(&self) -> usize {
        match self.inflight_count.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1)) {
            Ok(prev) => prev - 1,
            Err(_) => {
                log::warn!("{} in-flight counter already zero", self.id());
                0
            }
        }
    }

    /// Registers a future the broker waits for when closing this connection during shutdown.
    #[inline]
    pub fn set_graceful_disconnect(&self, f: Completion<()>) {
        *self.graceful_disconnect.lock() = Some(f);
    }

    /// Resolved once the session has finished its cleanup.
    #[inline]
    pub fn closed(&self) -> &Completion<()> {
        &self.closed
    }

    /// Closes the transport and waits for the graceful disconnect future, if one is registered.
    pub async fn shutdown(&self) {
        let close = self.transport.close();
        let graceful = self.graceful_disconnect.lock().clone();
        close.await;
        if let Some(graceful) = graceful {
            graceful.wait().await;
        }
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ClientConnection {{ id: {}, protocol: {:?}, receive_maximum: {:?}, session_expiry_interval: {}, inflights: {} }}",
            self.id(),
            self.info.protocol,
            self.info.receive_maximum,
            self.info.session_expiry_interval,
            self.inflight_count()
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transport::{ChannelTransport, Outgoing};

    pub(crate) fn test_connection(
        info: ConnectInfo,
    ) -> (Arc<ClientConnection>, Outgoing, mpsc::UnboundedReceiver<SessionEvent>) {
        let (transport, outgoing) = ChannelTransport::pair();
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ClientConnection::new(info, Arc::new(transport), tx)), outgoing, rx)
    }

    #[test]
    fn window_is_min_of_receive_maximum_and_config() {
        let (c, _, _) = test_connection(ConnectInfo::new("a", ProtocolVersion::V5).receive_maximum(10));
        assert_eq!(c.max_inflight_window(50), 10);
        assert_eq!(c.max_inflight_window(4), 4);
        let (c, _, _) = test_connection(ConnectInfo::new("b", ProtocolVersion::V3_1_1));
        assert_eq!(c.max_inflight_window(50), 50);
        let (c, _, _) = test_connection(ConnectInfo::new("c", ProtocolVersion::V5).receive_maximum(0));
        assert_eq!(c.max_inflight_window(50), 50);
    }

    #[test]
    fn failed_hand_off_does_not_leak_inflight_count() {
        let (c, _out, rx) = test_connection(ConnectInfo::new("a", ProtocolVersion::V5));
        drop(rx);
        let publish = Publish::new("t", crate::types::QoS::AtLeastOnce, bytes::Bytes::new());
        assert_eq!(c.deliver(publish, DeliveryTarget::Client), Err(ChannelClosed));
        assert_eq!(c.inflight_count(), 0);
        assert_eq!(c.end_delivery(), 0);
    }

    #[tokio::test]
    async fn shutdown_waits_for_graceful_disconnect() {
        let (c, _out, _rx) = test_connection(ConnectInfo::new("a", ProtocolVersion::V5));
        let graceful = Completion::new();
        c.set_graceful_disconnect(graceful.clone());
        let g = graceful.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            g.resolve(());
        });
        c.shutdown().await;
        assert!(graceful.is_done());
        assert!(!c.is_open());
    }
}
