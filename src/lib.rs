// Copyright 2020 Joyent, Inc.

//! ONC RPC record-marked transport over TCP.
//!
//! This crate is the transport layer of an ONC RPC (RFC 1831) client for
//! NFS-family services: it frames an arbitrary-length RPC message into
//! record-marking fragments, sends them over a managed TCP connection,
//! reassembles the reply fragments, and hands the reply back to the
//! caller whose transaction id (XID) it matches, creating, reusing, and
//! discarding connections per remote endpoint as it goes. What the bytes
//! inside a message mean (NFS, MOUNT, PORTMAP procedures, credentials) is
//! the business of the layer above; here a message is an opaque [`Xdr`]
//! buffer.
//!
//! Wire format (RFC 1831 §10, record marking):
//!
//! A message is carried as one or more fragments, each laid out as:
//!
//! * `HDR1...HDR4`: 4-byte big-endian word. Bit 31 is the last-fragment
//!   flag, set only on the final fragment of a message; bits 0-30 are the
//!   fragment's payload length in bytes, excluding the header itself.
//!
//! * `DATA1...DATAN`: fragment payload. The complete RPC message is the
//!   concatenation of every fragment's payload, in order, up to and
//!   including the flagged fragment.
//!
//! The first four bytes of the assembled message are the XID, a 32-bit
//! value chosen by the requester and echoed by the responder. Replies
//! may arrive in any order; correlation is by XID alone.
//!
//! The entry point is [`NetMgr`]: one instance per process, a blocking
//! [`NetMgr::send_and_wait`] callable from any number of threads, and a
//! single [`NetMgr::shutdown`] at teardown.

#![allow(missing_docs)]

pub mod connection;
pub mod error;
pub mod netmgr;
pub mod protocol;
pub mod xdr;

pub use self::connection::{Connection, State, PRIVILEGED_PORT_FLOOR};
pub use self::error::RpcError;
pub use self::netmgr::{EndpointKey, NetMgr};
pub use self::xdr::Xdr;
