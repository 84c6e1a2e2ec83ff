// Copyright 2020 Joyent, Inc.

//! RFC 1831 record marking.
//!
//! RPC messages carried over a byte-stream transport are delimited by
//! record marking: each message is sent as one or more fragments, and
//! each fragment is prefixed by a 4-byte big-endian header whose high bit
//! flags the last fragment of the record and whose low 31 bits give the
//! fragment length in bytes, excluding the header itself.
//!
//! Encoding is a pure function from an [`Xdr`] to wire bytes. Decoding is
//! split in two stages, mirroring the inbound pipeline: [`RecordCodec`]
//! is the streaming frame detector that waits until every fragment of a
//! record has arrived, and [`remove_record_marking`] strips the fragment
//! headers from a completed record and extracts the XID.

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::RpcError;
use crate::xdr::Xdr;

/// Fragment size bound. The RFC suggests sizing records to the link MTU,
/// but some NFS servers kill the connection when a record arrives in
/// multiple fragments ("RPC: multiple fragments per record not
/// supported"), so the bound is set far above any real MTU and nearly
/// every message goes out as a single fragment.
pub const MTU_SIZE: usize = 1024 * 1024;

/// High bit of a fragment header: set on the last fragment of a record.
pub const LAST_FRAG: u32 = 0x8000_0000;

/// Mask applied to a fragment header to recover the real fragment size.
pub const SIZE_MASK: u32 = 0x7fff_ffff;

pub fn is_last_fragment(header: u32) -> bool {
    (header & LAST_FRAG) != 0
}

pub fn mask_fragment_size(header: u32) -> u32 {
    header & SIZE_MASK
}

/// Add record marking to an outbound message, writing the framed bytes
/// into `dst`.
///
/// The written prefix of the primary buffer and each payload segment form
/// an ordered list of byte ranges. Consecutive ranges are packed into
/// fragments of at most [`MTU_SIZE`] bytes. Fragment boundaries may only
/// fall between ranges, never inside one, preserving scatter-gather
/// semantics for payloads such as write data; a single range larger than
/// the bound therefore fails with [`RpcError::Encode`].
pub fn add_record_marking(message: &Xdr, dst: &mut BytesMut) -> Result<(), RpcError> {
    let mut ranges: Vec<&[u8]> = Vec::with_capacity(1 + message.payloads().len());
    ranges.push(message.written());
    for payload in message.payloads() {
        ranges.push(payload.as_ref());
    }

    dst.reserve(message.wire_len() + 4 * (message.wire_len() / MTU_SIZE + 1));

    let mut fragment: Vec<&[u8]> = Vec::with_capacity(ranges.len());
    let mut fragment_len = 0;
    for range in ranges {
        if range.len() > MTU_SIZE {
            return Err(RpcError::Encode { size: range.len() });
        }
        if fragment_len + range.len() > MTU_SIZE {
            write_fragment(dst, &fragment, fragment_len, false);
            fragment.clear();
            fragment_len = 0;
        }
        fragment.push(range);
        fragment_len += range.len();
    }
    write_fragment(dst, &fragment, fragment_len, true);
    Ok(())
}

fn write_fragment(dst: &mut BytesMut, ranges: &[&[u8]], len: usize, last: bool) {
    let header = if last {
        LAST_FRAG | len as u32
    } else {
        len as u32
    };
    dst.put_u32(header);
    for range in ranges {
        dst.put_slice(range);
    }
}

/// Remove record marking from a completed record and convert it to an
/// [`Xdr`].
///
/// Fragment payloads are concatenated in arrival order with their headers
/// stripped. The first four bytes of the assembled message are read as
/// the big-endian XID and stored on the buffer without consuming them:
/// the returned cursor is 0, so a reader of the RPC payload still sees
/// the XID as the first field, matching the RFC 1831 message layout.
pub fn remove_record_marking(record: &[u8]) -> Result<Xdr, RpcError> {
    let mut message = Xdr::with_capacity(record.len());
    let mut pos = 0;
    let mut last = false;

    while !last {
        if record.len() - pos < 4 {
            return Err(RpcError::Protocol {
                detail: "truncated fragment header".to_string(),
            });
        }
        let header = BigEndian::read_u32(&record[pos..pos + 4]);
        last = is_last_fragment(header);
        let frag_size = mask_fragment_size(header) as usize;
        pos += 4;

        if record.len() - pos < frag_size {
            return Err(RpcError::Protocol {
                detail: format!(
                    "fragment of {} bytes truncated after {} bytes",
                    frag_size,
                    record.len() - pos
                ),
            });
        }
        message.put_bytes(&record[pos..pos + frag_size]);
        pos += frag_size;
    }

    if message.len() < 4 {
        return Err(RpcError::Protocol {
            detail: format!("{}-byte message is too short to carry an xid", message.len()),
        });
    }
    let xid = BigEndian::read_u32(&message.as_slice()[..4]);
    message.set_xid(xid);
    message.set_offset(0);
    Ok(message)
}

/// Streaming codec for record-marked RPC messages.
///
/// The decode side is the frame detector: it consumes raw bytes arriving
/// in arbitrarily sized chunks and emits a message only once every
/// fragment of a record is buffered, carrying the bytes-scanned-so-far
/// accumulator across invocations. One instance serves exactly one
/// connection; accumulator state must never be shared across channels.
pub struct RecordCodec {
    /// Bytes of the inbound buffer already scanned as complete fragments
    /// of the record currently being assembled. Reset to 0 after each
    /// emitted message.
    record_length: usize,
}

impl RecordCodec {
    pub fn new() -> RecordCodec {
        RecordCodec { record_length: 0 }
    }
}

impl Default for RecordCodec {
    fn default() -> Self {
        RecordCodec::new()
    }
}

impl Decoder for RecordCodec {
    type Item = Xdr;
    type Error = RpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Xdr>, RpcError> {
        loop {
            let available = src.len() - self.record_length;
            if available < 4 {
                return Ok(None);
            }
            let header = BigEndian::read_u32(&src[self.record_length..self.record_length + 4]);
            let frag_size = mask_fragment_size(header) as usize;
            if available - 4 < frag_size {
                // The fragment is still in flight; leave the read
                // position where this record began.
                return Ok(None);
            }
            self.record_length += 4 + frag_size;
            if is_last_fragment(header) {
                let record = src.split_to(self.record_length);
                self.record_length = 0;
                return remove_record_marking(&record).map(Some);
            }
        }
    }
}

impl Encoder<Xdr> for RecordCodec {
    type Error = RpcError;

    fn encode(&mut self, message: Xdr, dst: &mut BytesMut) -> Result<(), RpcError> {
        add_record_marking(&message, dst)
    }
}
