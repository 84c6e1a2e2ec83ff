// Copyright 2020 Joyent, Inc.

//! Transport-level errors surfaced to the RPC-call layer.
//!
//! This layer never retries or reconnects on its own. Each variant carries
//! the context a caller needs to decide whether to retry; a retried call
//! goes back through the connection registry, which hands out a brand-new
//! connection if the old one is gone.

use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RpcError {
    /// A single indivisible payload segment is larger than the fragment
    /// size bound. Fragment boundaries may only fall between segments, so
    /// the message cannot be sent.
    #[error("payload segment of {size} bytes exceeds the 1 MiB fragment bound")]
    Encode { size: usize },

    /// The transport connection could not be established.
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// No reply with a matching XID arrived within the caller's window.
    /// The connection itself stays open; other in-flight requests are
    /// unaffected.
    #[error("no reply for xid {xid:#010x} within {after:?}")]
    Timeout { xid: u32, after: Duration },

    /// The underlying channel closed (peer-initiated, local, or an
    /// unrecoverable I/O fault) while the request was pending.
    #[error("connection closed: {detail}")]
    ConnectionClosed { detail: String },

    /// The inbound fragment stream was malformed. Fatal for the
    /// connection carrying it.
    #[error("malformed record stream: {detail}")]
    Protocol { detail: String },

    /// The client was already shut down when the request was made.
    #[error("the RPC client has been shut down")]
    Shutdown,
}

/// Required by the codec traits. An I/O fault during framed reads means
/// the channel is no longer usable.
impl From<io::Error> for RpcError {
    fn from(e: io::Error) -> Self {
        RpcError::ConnectionClosed {
            detail: e.to_string(),
        }
    }
}
