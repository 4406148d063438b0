use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use futures::future::{self, BoxFuture, FutureExt};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::completion::Completion;
use crate::connection::ClientConnection;
use crate::stats::Stats;
use crate::types::{ClientId, DashMap};

/// A server-bound socket accepting new connections.
pub trait Listener: Send + Sync {
    fn name(&self) -> &str;

    /// Stops accepting and resolves once the socket is closed.
    fn close(&self) -> BoxFuture<'static, ()>;
}

/// Listener whose accept loop watches `token` and resolves `stopped` on exit.
pub struct ListenerHandle {
    name: String,
    token: CancellationToken,
    stopped: Completion<()>,
}

impl ListenerHandle {
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self { name: name.into(), token: CancellationToken::new(), stopped: Completion::new() }
    }

    #[inline]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    #[inline]
    pub fn stopped(&self) -> Completion<()> {
        self.stopped.clone()
    }
}

impl Listener for ListenerHandle {
    #[inline]
    fn name(&self) -> &str {
        &self.name
    }

    fn close(&self) -> BoxFuture<'static, ()> {
        self.token.cancel();
        let stopped = self.stopped.clone();
        async move { stopped.wait().await }.boxed()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub listeners: usize,
    pub batches: usize,
    pub connections: usize,
    pub interrupted: bool,
}

/// Client id to live connection map, and the broker's bulk teardown.
pub struct ConnectionRegistry {
    connections: DashMap<ClientId, Arc<ClientConnection>>,
    listeners: RwLock<Vec<Arc<dyn Listener>>>,
    interrupted: AtomicBool,
    partition_size: usize,
    legacy: bool,
    stats: Arc<Stats>,
}

impl ConnectionRegistry {
    pub fn new(partition_size: usize, legacy: bool, stats: Arc<Stats>) -> Self {
        Self {
            connections: DashMap::default(),
            listeners: RwLock::new(Vec::new()),
            interrupted: AtomicBool::new(false),
            partition_size: partition_size.max(1),
            legacy,
            stats,
        }
    }

    /// Registers `conn` unless its client id is taken, in which case the registered
    /// connection is returned and nothing changes.
    pub fn insert_if_absent(&self, conn: Arc<ClientConnection>) -> Option<Arc<ClientConnection>> {
        match self.connections.entry(conn.id().clone()) {
            Entry::Occupied(e) => Some(e.get().clone()),
            Entry::Vacant(e) => {
                e.insert(conn);
                self.stats.connections.inc();
                None
            }
        }
    }

    /// Removes the entry for `conn`'s client id only if it is `conn` itself.
    pub fn remove(&self, conn: &Arc<ClientConnection>) -> bool {
        let removed = self.connections.remove_if(conn.id(), |_, registered| Arc::ptr_eq(registered, conn)).is_some();
        if removed {
            self.stats.connections.dec();
        }
        removed
    }

    #[inline]
    pub fn get(&self, client_id: &ClientId) -> Option<Arc<ClientConnection>> {
        self.connections.get(client_id).map(|e| e.value().clone())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn add_listener(&self, listener: Arc<dyn Listener>) {
        self.listeners.write().push(listener);
    }

    /// Batches of a running or future shutdown that have not started are skipped.
    #[inline]
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Closes all listeners concurrently, then the live connections in batches of
    /// `partition_size`, each batch finishing before the next one starts.
    pub async fn shutdown(&self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        if self.legacy {
            log::info!("legacy shutdown, connections are left to the runtime");
            return report;
        }

        let listeners = self.listeners.read().clone();
        report.listeners = listeners.len();
        future::join_all(listeners.iter().map(|l| {
            log::debug!("closing listener {}", l.name());
            l.close()
        }))
        .await;
        log::info!("{} listeners closed", report.listeners);

        let conns: Vec<Arc<ClientConnection>> = self.connections.iter().map(|e| e.value().clone()).collect();
        for batch in conns.chunks(self.partition_size) {
            if self.is_interrupted() {
                log::warn!("shutdown interrupted, {} connections left open", conns.len() - report.connections);
                report.interrupted = true;
                break;
            }
            future::join_all(batch.iter().map(|c| c.shutdown())).await;
            report.batches += 1;
            report.connections += batch.len();
            log::debug!("shutdown batch {} done, {} connections closed", report.batches, report.connections);
        }
        log::info!("{} connections closed in {} batches", report.connections, report.batches);
        report
    }
}
