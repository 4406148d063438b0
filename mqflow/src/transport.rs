use futures::future::{self, BoxFuture, FutureExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ChannelClosed;
use crate::types::Packet;

pub type WriteFuture = BoxFuture<'static, Result<(), ChannelClosed>>;

/// The network side of one client connection.
///
/// `write` queues the packet before it returns; awaiting the returned future is only
/// needed to learn whether it reached the connection's writer.
pub trait Transport: Send + Sync + 'static {
    fn write(&self, packet: Packet) -> WriteFuture;

    fn close(&self) -> BoxFuture<'static, ()>;

    fn is_open(&self) -> bool;

    /// Resolves once the channel became inactive, whichever side closed it.
    fn inactive(&self) -> BoxFuture<'static, ()>;
}

/// Transport backed by an unbounded channel drained by the connection's writer task.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Packet>,
    closed: CancellationToken,
}

/// Writer side of a [`ChannelTransport`].
pub struct Outgoing {
    rx: mpsc::UnboundedReceiver<Packet>,
    closed: CancellationToken,
}

impl ChannelTransport {
    pub fn pair() -> (ChannelTransport, Outgoing) {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        (ChannelTransport { tx, closed: closed.clone() }, Outgoing { rx, closed })
    }
}

impl Transport for ChannelTransport {
    #[inline]
    fn write(&self, packet: Packet) -> WriteFuture {
        let res = if self.closed.is_cancelled() {
            Err(ChannelClosed)
        } else {
            self.tx.send(packet).map_err(|_| ChannelClosed)
        };
        future::ready(res).boxed()
    }

    #[inline]
    fn close(&self) -> BoxFuture<'static, ()> {
        self.closed.cancel();
        future::ready(()).boxed()
    }

    #[inline]
    fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && !self.tx.is_closed()
    }

    fn inactive(&self) -> BoxFuture<'static, ()> {
        let closed = self.closed.clone();
        let tx = self.tx.clone();
        async move {
            tokio::select! {
                _ = closed.cancelled() => {},
                _ = tx.closed() => {},
            }
        }
        .boxed()
    }
}

impl Outgoing {
    /// Next packet to put on the wire, `None` once the transport is closed and drained.
    pub async fn recv(&mut self) -> Option<Packet> {
        let closed = self.closed.clone();
        let received = tokio::select! {
            biased;
            p = self.rx.recv() => Some(p),
            _ = closed.cancelled() => None,
        };
        match received {
            Some(p) => p,
            None => self.rx.try_recv().ok(),
        }
    }

    #[inline]
    pub fn try_recv(&mut self) -> Option<Packet> {
        self.rx.try_recv().ok()
    }

    /// All packets written so far.
    pub fn drain(&mut self) -> Vec<Packet> {
        let mut packets = Vec::new();
        while let Ok(p) = self.rx.try_recv() {
            packets.push(p);
        }
        packets
    }

    /// Peer side hang-up.
    #[inline]
    pub fn close(&self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PacketId, PublishAck, PublishAckReason};

    fn puback(v: u16) -> Packet {
        Packet::PublishAck(PublishAck::new(PacketId::new(v).unwrap(), PublishAckReason::Success))
    }

    #[tokio::test]
    async fn writes_arrive_in_order_until_closed() {
        let (t, mut out) = ChannelTransport::pair();
        assert!(t.is_open());
        assert_eq!(t.write(puback(1)).await, Ok(()));
        assert_eq!(t.write(puback(2)).await, Ok(()));
        t.close().await;
        assert!(!t.is_open());
        assert_eq!(t.write(puback(3)).await, Err(ChannelClosed));
        t.inactive().await;
        assert_eq!(out.drain(), vec![puback(1), puback(2)]);
    }

    #[tokio::test]
    async fn dropping_writer_marks_inactive() {
        let (t, out) = ChannelTransport::pair();
        drop(out);
        t.inactive().await;
        assert!(!t.is_open());
        assert_eq!(t.write(puback(1)).await, Err(ChannelClosed));
    }
}
