// Copyright 2020 Joyent, Inc.

//! One TCP connection to one RPC endpoint.
//!
//! A `Connection` owns the channel to a single (host, port,
//! privileged-port) endpoint, the map of in-flight requests keyed by XID,
//! and a pair of tasks on the shared runtime: a reader draining
//! record-marked replies through [`RecordCodec`] and a writer flushing
//! pre-framed requests. Those tasks are the only code that touches the
//! socket; caller threads block inside [`Connection::send_and_wait`] on a
//! per-request completion slot until their reply is delivered, their
//! timeout fires, or the channel closes.
//!
//! A connection is never reconnected. Portmap services disconnect idle
//! TCP connections after a few seconds, and mount and NFS services may be
//! listening on a different temporary port after a server restart, so
//! once a channel drops, the only safe recovery is a fresh connection
//! (and with it a fresh port resolution) created by the registry when
//! the next request arrives.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use futures::StreamExt;
use slog::{debug, error, warn, Logger};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::codec::FramedRead;

use crate::error::RpcError;
use crate::protocol::{self, RecordCodec};
use crate::xdr::Xdr;

/// Lowest local port tried when searching for a free privileged port.
/// The probe walks downward from 1023; how far down it may go is
/// deployment policy rather than protocol, hence a named constant.
pub const PRIVILEGED_PORT_FLOOR: u16 = 512;

/// Connection lifecycle. `Closed` is terminal and entered at most once;
/// no transition leads out of it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Idle,
    Connecting,
    Connected,
    Closed,
}

/// Invoked once, when the connection transitions to `Closed`, so the
/// registry can forget it immediately rather than on the next failed
/// lookup.
pub(crate) type DropHook = Box<dyn Fn(&Connection) + Send + Sync>;

type ReplySlot = SyncSender<Result<Xdr, RpcError>>;

#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    host: String,
    port: u16,
    use_privileged_port: bool,
    state: Mutex<State>,
    /// Serializes connection establishment across caller threads.
    connect_lock: Mutex<()>,
    /// Feed to the writer task; `None` until connected, and again once
    /// closed.
    writer: Mutex<Option<UnboundedSender<Bytes>>>,
    /// In-flight requests awaiting a matching-XID reply.
    pending: DashMap<u32, ReplySlot>,
    handle: Handle,
    drop_hook: DropHook,
    log: Logger,
    created: Instant,
    last_active: Mutex<Instant>,
}

impl Connection {
    pub(crate) fn new(
        host: &str,
        port: u16,
        use_privileged_port: bool,
        handle: Handle,
        drop_hook: DropHook,
        log: Logger,
    ) -> Connection {
        let now = Instant::now();
        Connection {
            inner: Arc::new(Inner {
                host: host.to_string(),
                port,
                use_privileged_port,
                state: Mutex::new(State::Idle),
                connect_lock: Mutex::new(()),
                writer: Mutex::new(None),
                pending: DashMap::new(),
                handle,
                drop_hook,
                log,
                created: now,
                last_active: Mutex::new(now),
            }),
        }
    }

    pub fn state(&self) -> State {
        *self.inner.state.lock().unwrap()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == State::Closed
    }

    pub fn created(&self) -> Instant {
        self.inner.created
    }

    pub fn last_active(&self) -> Instant {
        *self.inner.last_active.lock().unwrap()
    }

    pub(crate) fn host(&self) -> &str {
        &self.inner.host
    }

    pub(crate) fn port(&self) -> u16 {
        self.inner.port
    }

    pub(crate) fn use_privileged_port(&self) -> bool {
        self.inner.use_privileged_port
    }

    /// Whether two handles refer to the same connection instance.
    pub(crate) fn same_as(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.inner.host, self.inner.port)
    }

    fn closed_error(&self) -> RpcError {
        RpcError::ConnectionClosed {
            detail: format!("connection to {} is closed", self.endpoint()),
        }
    }

    /// Send a request and block until the matching-XID reply arrives, the
    /// timeout elapses, or the connection closes.
    ///
    /// Connects lazily on first use. The caller is responsible for XID
    /// allocation: `request.xid()` must match the first four bytes of the
    /// written buffer, and at most one in-flight request may use a given
    /// XID on one connection.
    pub fn send_and_wait(&self, timeout: Duration, request: Xdr) -> Result<Xdr, RpcError> {
        self.ensure_connected(timeout)?;

        let xid = request.xid();
        let mut wire = BytesMut::new();
        protocol::add_record_marking(&request, &mut wire)?;

        let (slot, reply_rx) = sync_channel(1);
        self.inner.pending.insert(xid, slot);

        // The channel may have closed between the connectedness check and
        // the insert; an entry added after the close drain would never be
        // failed, so re-check before waiting.
        if self.is_closed() {
            self.inner.pending.remove(&xid);
            return Err(self.closed_error());
        }

        let sender = match self.inner.writer.lock().unwrap().as_ref() {
            Some(sender) => sender.clone(),
            None => {
                self.inner.pending.remove(&xid);
                return Err(self.closed_error());
            }
        };
        if sender.send(wire.freeze()).is_err() {
            self.inner.pending.remove(&xid);
            return Err(self.closed_error());
        }
        *self.inner.last_active.lock().unwrap() = Instant::now();

        match reply_rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                if self.inner.pending.remove(&xid).is_some() {
                    Err(RpcError::Timeout {
                        xid,
                        after: timeout,
                    })
                } else {
                    // Delivery won the race against the timeout: whoever
                    // removed the entry is about to complete the slot.
                    reply_rx.recv().unwrap_or_else(|_| Err(self.closed_error()))
                }
            }
            Err(RecvTimeoutError::Disconnected) => Err(self.closed_error()),
        }
    }

    fn ensure_connected(&self, timeout: Duration) -> Result<(), RpcError> {
        let _guard = self.inner.connect_lock.lock().unwrap();
        let state = self.state();
        match state {
            State::Connected => Ok(()),
            State::Closed => Err(self.closed_error()),
            State::Idle | State::Connecting => self.do_connect(timeout),
        }
    }

    fn do_connect(&self, timeout: Duration) -> Result<(), RpcError> {
        *self.inner.state.lock().unwrap() = State::Connecting;
        debug!(self.inner.log, "connecting");

        let attempt = self
            .inner
            .handle
            .block_on(async { tokio::time::timeout(timeout, self.establish()).await });
        let stream = match attempt {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.close("connect failed");
                return Err(RpcError::Connect {
                    endpoint: self.endpoint(),
                    source: e,
                });
            }
            Err(_) => {
                self.close("connect timed out");
                return Err(RpcError::Connect {
                    endpoint: self.endpoint(),
                    source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                });
            }
        };

        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = unbounded_channel();
        *self.inner.writer.lock().unwrap() = Some(tx);
        *self.inner.state.lock().unwrap() = State::Connected;
        debug!(self.inner.log, "connected");

        let frames = FramedRead::new(read_half, RecordCodec::new());
        self.inner.handle.spawn(read_loop(self.clone(), frames));
        self.inner.handle.spawn(write_loop(self.clone(), write_half, rx));
        Ok(())
    }

    async fn establish(&self) -> io::Result<TcpStream> {
        if self.inner.use_privileged_port {
            let remote = lookup_host((self.inner.host.as_str(), self.inner.port))
                .await?
                .next()
                .ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::AddrNotAvailable,
                        "hostname resolved to no addresses",
                    )
                })?;
            self.connect_from_privileged_port(remote).await
        } else {
            TcpStream::connect((self.inner.host.as_str(), self.inner.port)).await
        }
    }

    /// Probe downward through the privileged local port range until a
    /// bind succeeds, then connect from that port. Bind failures are
    /// expected while probing and must not reach the error log; a
    /// failure of the connect itself is a real one.
    async fn connect_from_privileged_port(&self, remote: SocketAddr) -> io::Result<TcpStream> {
        for local_port in (PRIVILEGED_PORT_FLOOR..=1023).rev() {
            let socket = if remote.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.set_reuseaddr(true)?;
            let local: SocketAddr = if remote.is_ipv4() {
                (Ipv4Addr::UNSPECIFIED, local_port).into()
            } else {
                (Ipv6Addr::UNSPECIFIED, local_port).into()
            };
            match socket.bind(local) {
                Ok(()) => return socket.connect(remote).await,
                Err(e) => debug!(
                    self.inner.log,
                    "local port {} unavailable: {}", local_port, e
                ),
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "no privileged local port available",
        ))
    }

    /// Route a decoded reply to the caller waiting on its XID. A reply
    /// with no waiter was answered after its caller timed out; drop it.
    fn deliver(&self, reply: Xdr) {
        *self.inner.last_active.lock().unwrap() = Instant::now();
        let xid = reply.xid();
        match self.inner.pending.remove(&xid) {
            Some((_, slot)) => {
                let _ = slot.try_send(Ok(reply));
            }
            None => debug!(
                self.inner.log,
                "no waiter for xid {:#010x}, discarding reply", xid
            ),
        }
    }

    /// Transition to `Closed` (at most once), fail every pending request,
    /// and tell the registry to forget this connection.
    pub(crate) fn close(&self, reason: &str) {
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state == State::Closed {
                return;
            }
            *state = State::Closed;
        }
        warn!(self.inner.log, "closing connection: {}", reason);

        self.inner.writer.lock().unwrap().take();

        let waiting: Vec<u32> = self.inner.pending.iter().map(|entry| *entry.key()).collect();
        for xid in waiting {
            if let Some((_, slot)) = self.inner.pending.remove(&xid) {
                let _ = slot.try_send(Err(self.closed_error()));
            }
        }

        (self.inner.drop_hook)(self);
    }
}

async fn read_loop(conn: Connection, mut frames: FramedRead<OwnedReadHalf, RecordCodec>) {
    let reason;
    loop {
        match frames.next().await {
            Some(Ok(reply)) => conn.deliver(reply),
            Some(Err(e)) => {
                error!(conn.inner.log, "error on connection: {}", e);
                reason = "receive error";
                break;
            }
            None => {
                reason = "channel closed by peer";
                break;
            }
        }
    }
    conn.close(reason);
}

async fn write_loop(
    conn: Connection,
    mut write_half: OwnedWriteHalf,
    mut records: UnboundedReceiver<Bytes>,
) {
    while let Some(record) = records.recv().await {
        if let Err(e) = write_half.write_all(&record).await {
            warn!(conn.inner.log, "write failed: {}", e);
            conn.close("send error");
            return;
        }
    }
    // All senders are gone, meaning the connection already closed;
    // release our half of the socket.
    let _ = write_half.shutdown().await;
}
