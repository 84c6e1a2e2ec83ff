// Copyright 2020 Joyent, Inc.

//! The `Xdr` message buffer.
//!
//! An `Xdr` is an opaque, growable byte buffer with a single read/write
//! cursor. The RPC-call layer builds requests into one (writes go at the
//! cursor, extending the buffer as needed) and the record-marking decoder
//! produces one per complete reply. Large opaque payloads, such as NFS
//! write data, can ride along as extra scatter segments so they are
//! framed onto the wire without being copied into the primary buffer.

use std::fmt;

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;

pub struct Xdr {
    buf: Vec<u8>,
    offset: usize,
    xid: u32,
    payloads: Vec<Bytes>,
}

impl Xdr {
    pub fn with_capacity(capacity: usize) -> Xdr {
        Xdr {
            buf: Vec::with_capacity(capacity),
            offset: 0,
            xid: 0,
            payloads: Vec::new(),
        }
    }

    /// The read/write cursor. For a freshly built request this is the
    /// number of bytes written; for a decoded reply it starts at 0.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn set_offset(&mut self, offset: usize) {
        self.offset = offset;
    }

    /// Total bytes in the primary buffer, independent of the cursor.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The transaction id. Meaningful only once the buffer holds a full
    /// RPC message, whose first four bytes are the XID; undefined while
    /// the buffer is still under construction.
    pub fn xid(&self) -> u32 {
        self.xid
    }

    pub fn set_xid(&mut self, xid: u32) {
        self.xid = xid;
    }

    /// Write `src` at the cursor, overwriting existing bytes and growing
    /// the buffer as needed, then advance the cursor past it.
    pub fn put_bytes(&mut self, src: &[u8]) {
        let end = self.offset + src.len();
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        }
        self.buf[self.offset..end].copy_from_slice(src);
        self.offset = end;
    }

    /// Write a big-endian XDR unsigned integer at the cursor.
    pub fn put_u32(&mut self, value: u32) {
        let mut word = [0u8; 4];
        BigEndian::write_u32(&mut word, value);
        self.put_bytes(&word);
    }

    /// Read `len` bytes from the cursor, or `None` if fewer remain.
    pub fn get_bytes(&mut self, len: usize) -> Option<&[u8]> {
        let end = self.offset.checked_add(len)?;
        if end > self.buf.len() {
            return None;
        }
        let bytes = &self.buf[self.offset..end];
        self.offset = end;
        Some(bytes)
    }

    /// Read a big-endian XDR unsigned integer from the cursor, or `None`
    /// if fewer than four bytes remain.
    pub fn get_u32(&mut self) -> Option<u32> {
        self.get_bytes(4).map(BigEndian::read_u32)
    }

    /// The whole primary buffer.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// The written prefix of the primary buffer, `buf[..offset]`. This is
    /// what goes on the wire ahead of the payload segments.
    pub fn written(&self) -> &[u8] {
        &self.buf[..self.offset]
    }

    /// Append an extra payload segment. Segments are framed after the
    /// primary buffer, in append order, and are never split across
    /// fragment boundaries.
    pub fn add_payload(&mut self, payload: Bytes) {
        self.payloads.push(payload);
    }

    pub fn payloads(&self) -> &[Bytes] {
        &self.payloads
    }

    /// Combined size of the written prefix and all payload segments.
    pub fn wire_len(&self) -> usize {
        self.offset + self.payloads.iter().map(|p| p.len()).sum::<usize>()
    }
}

impl fmt::Debug for Xdr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Xdr")
            .field("len", &self.buf.len())
            .field("offset", &self.offset)
            .field("xid", &format_args!("{:#010x}", self.xid))
            .field("payloads", &self.payloads.len())
            .finish()
    }
}
