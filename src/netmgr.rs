// Copyright 2020 Joyent, Inc.

//! The connection registry.
//!
//! `NetMgr` tracks one [`Connection`] per endpoint (privileged and
//! non-privileged connections to the same (host, port) are distinct,
//! since they draw from disjoint local port ranges) and owns the Tokio
//! runtime whose worker threads service every connection's channel. It is
//! application-scoped state with an explicit lifecycle: create one per
//! process (or per test), call [`NetMgr::send_and_wait`] from as many
//! threads as needed, and call [`NetMgr::shutdown`] exactly once at
//! teardown.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use slog::{info, o, Drain, Logger};
use tokio::runtime::{Builder, Handle, Runtime};

use crate::connection::{Connection, DropHook};
use crate::error::RpcError;
use crate::xdr::Xdr;

/// A remote RPC endpoint. The privileged-port flag is not part of the
/// key; privileged connections are tracked in their own map.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

pub struct NetMgr {
    registry: Arc<Registry>,
    runtime: Mutex<Option<Runtime>>,
}

struct Registry {
    connections: DashMap<EndpointKey, Connection>,
    privileged_connections: DashMap<EndpointKey, Connection>,
    handle: Handle,
    log: Logger,
    connects: AtomicUsize,
    shut_down: AtomicBool,
}

impl Registry {
    fn map(&self, use_privileged_port: bool) -> &DashMap<EndpointKey, Connection> {
        if use_privileged_port {
            &self.privileged_connections
        } else {
            &self.connections
        }
    }

    /// Forget a connection that reported itself closed. Only the exact
    /// instance is removed: a replacement connection created for the same
    /// endpoint in the meantime must survive.
    fn forget(&self, conn: &Connection) {
        let key = EndpointKey {
            host: conn.host().to_string(),
            port: conn.port(),
        };
        self.map(conn.use_privileged_port())
            .remove_if(&key, |_, tracked| tracked.same_as(conn));
    }
}

impl NetMgr {
    /// Create a registry with its own runtime. With no logger, records
    /// go to the `log` facade, matching whatever the application has
    /// configured there.
    pub fn new(log: Option<Logger>) -> io::Result<NetMgr> {
        let log = log.unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let runtime = Builder::new_multi_thread()
            .thread_name("oncrpc-net")
            .enable_all()
            .build()?;
        let registry = Arc::new(Registry {
            connections: DashMap::new(),
            privileged_connections: DashMap::new(),
            handle: runtime.handle().clone(),
            log,
            connects: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
        });
        Ok(NetMgr {
            registry,
            runtime: Mutex::new(Some(runtime)),
        })
    }

    /// Send `request` to the endpoint, creating or reusing its
    /// connection as necessary, and block until the reply with the
    /// matching XID arrives or `timeout` elapses.
    ///
    /// This call blocks the current thread and must not be made from
    /// within an asynchronous execution context.
    pub fn send_and_wait(
        &self,
        host: &str,
        port: u16,
        use_privileged_port: bool,
        request: Xdr,
        timeout: Duration,
    ) -> Result<Xdr, RpcError> {
        if self.registry.shut_down.load(Ordering::SeqCst) {
            return Err(RpcError::Shutdown);
        }
        let connection = self.lookup(host, port, use_privileged_port);
        connection.send_and_wait(timeout, request)
    }

    /// Get the endpoint's tracked connection, creating one on a miss. A
    /// tracked connection found already closed is a stale entry whose
    /// drop hook has not won the race yet; replace it.
    fn lookup(&self, host: &str, port: u16, use_privileged_port: bool) -> Connection {
        let key = EndpointKey {
            host: host.to_string(),
            port,
        };
        let map = self.registry.map(use_privileged_port);
        loop {
            let connection = map
                .entry(key.clone())
                .or_insert_with(|| self.new_connection(host, port, use_privileged_port))
                .clone();
            if connection.is_closed() {
                map.remove_if(&key, |_, tracked| tracked.same_as(&connection));
                continue;
            }
            return connection;
        }
    }

    fn new_connection(&self, host: &str, port: u16, use_privileged_port: bool) -> Connection {
        self.registry.connects.fetch_add(1, Ordering::SeqCst);
        let registry = Arc::downgrade(&self.registry);
        let drop_hook: DropHook = Box::new(move |conn: &Connection| {
            if let Some(registry) = registry.upgrade() {
                registry.forget(conn);
            }
        });
        let log = self.registry.log.new(o!(
            "peer" => format!("{}:{}", host, port),
            "privileged" => use_privileged_port,
        ));
        Connection::new(
            host,
            port,
            use_privileged_port,
            self.registry.handle.clone(),
            drop_hook,
            log,
        )
    }

    /// Remove the endpoint's entries from both maps. Idempotent and safe
    /// to call speculatively; the connections themselves close when their
    /// channel does.
    pub fn drop_connection(&self, host: &str, port: u16) {
        let key = EndpointKey {
            host: host.to_string(),
            port,
        };
        self.registry.connections.remove(&key);
        self.registry.privileged_connections.remove(&key);
    }

    /// Close every tracked connection and release the runtime. The
    /// registry cannot be used afterwards; `send_and_wait` fails with
    /// [`RpcError::Shutdown`]. Expected to be called once, at process
    /// teardown, after in-flight calls have drained.
    pub fn shutdown(&self) {
        if self.registry.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(self.registry.log, "shutting down RPC client");

        let mut tracked: Vec<Connection> = Vec::new();
        for entry in self.registry.connections.iter() {
            tracked.push(entry.value().clone());
        }
        for entry in self.registry.privileged_connections.iter() {
            tracked.push(entry.value().clone());
        }
        self.registry.connections.clear();
        self.registry.privileged_connections.clear();
        for connection in tracked {
            connection.close("client shutdown");
        }

        if let Some(runtime) = self.runtime.lock().unwrap().take() {
            runtime.shutdown_background();
        }
    }

    /// Total connections created over the registry's lifetime, including
    /// ones since closed and dropped.
    pub fn connections_created(&self) -> usize {
        self.registry.connects.load(Ordering::SeqCst)
    }

    /// Currently tracked connections across both maps.
    pub fn connection_count(&self) -> usize {
        self.registry.connections.len() + self.registry.privileged_connections.len()
    }
}

impl Drop for NetMgr {
    fn drop(&mut self) {
        self.shutdown();
    }
}
