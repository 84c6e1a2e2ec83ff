// Copyright 2020 Joyent, Inc.

//! Client/server tests driving `NetMgr` against an in-process
//! record-marking echo server.
//!
//! The server speaks raw record marking over std TCP on its own OS
//! threads: read a record, treat its first four bytes as the XID, and
//! echo the body back framed. Individual tests swap in servers with less
//! cooperative behavior (withheld replies, reversed reply order, dropped
//! connections, dribbled bytes).

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use rand::Rng;
use slog::{o, Drain, Level, LevelFilter, Logger};

use oncrpc_tcp::protocol::{LAST_FRAG, MTU_SIZE, SIZE_MASK};
use oncrpc_tcp::{NetMgr, RpcError, Xdr};

fn test_log() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Debug,
        ))
        .fuse(),
        o!("build-id" => "0.1.0"),
    )
}

/// Read one complete record (all fragments, headers stripped) off the
/// stream, or `None` at a clean end of stream.
fn read_record(stream: &mut TcpStream) -> io::Result<Option<Vec<u8>>> {
    let mut body = Vec::new();
    loop {
        let header = match stream.read_u32::<BigEndian>() {
            Ok(header) => header,
            Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof && body.is_empty() => {
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let size = (header & SIZE_MASK) as usize;
        let mut frag = vec![0u8; size];
        stream.read_exact(&mut frag)?;
        body.extend_from_slice(&frag);
        if header & LAST_FRAG != 0 {
            return Ok(Some(body));
        }
    }
}

fn write_record(stream: &mut TcpStream, body: &[u8]) -> io::Result<()> {
    stream.write_u32::<BigEndian>(LAST_FRAG | body.len() as u32)?;
    stream.write_all(body)?;
    stream.flush()
}

/// Echo server: one thread per connection, echoing records until the
/// client goes away.
fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");
    thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(_) => break,
            };
            thread::spawn(move || {
                while let Ok(Some(body)) = read_record(&mut stream) {
                    if write_record(&mut stream, &body).is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

fn request(xid: u32, body: &[u8]) -> Xdr {
    let mut xdr = Xdr::with_capacity(4 + body.len());
    xdr.put_u32(xid);
    xdr.put_bytes(body);
    xdr.set_xid(xid);
    xdr
}

#[test]
fn echo_round_trip() {
    let addr = spawn_echo_server();
    let mgr = NetMgr::new(Some(test_log())).expect("netmgr");

    let mut reply = mgr
        .send_and_wait(
            "127.0.0.1",
            addr.port(),
            false,
            request(0x0a0b_0c0d, b"null procedure"),
            Duration::from_secs(5),
        )
        .expect("reply");

    assert_eq!(reply.xid(), 0x0a0b_0c0d);
    // The decoded cursor is 0: the XID is still the first readable field.
    assert_eq!(reply.get_u32(), Some(0x0a0b_0c0d));
    assert_eq!(reply.get_bytes(14), Some(&b"null procedure"[..]));
    assert_eq!(mgr.connections_created(), 1);

    mgr.shutdown();
}

#[test]
fn replies_in_reverse_order_route_by_xid() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let mut records = Vec::new();
        for _ in 0..3 {
            records.push(read_record(&mut stream).expect("read").expect("record"));
        }
        for body in records.iter().rev() {
            write_record(&mut stream, body).expect("write");
        }
    });

    let mgr = Arc::new(NetMgr::new(None).expect("netmgr"));
    let base_xid = rand::thread_rng().gen::<u16>() as u32;
    let mut workers = Vec::new();
    for i in 0..3u32 {
        let mgr = Arc::clone(&mgr);
        let port = addr.port();
        workers.push(thread::spawn(move || {
            let xid = base_xid + i;
            let mut body = vec![0u8; 24];
            rand::thread_rng().fill(&mut body[..]);
            let reply = mgr
                .send_and_wait(
                    "127.0.0.1",
                    port,
                    false,
                    request(xid, &body),
                    Duration::from_secs(10),
                )
                .expect("reply");
            assert_eq!(reply.xid(), xid);
            assert_eq!(&reply.as_slice()[4..], &body[..]);
        }));
    }
    for worker in workers {
        worker.join().expect("worker");
    }

    // All three callers shared one connection.
    assert_eq!(mgr.connections_created(), 1);
}

#[test]
fn timeout_leaves_sibling_request_pending() {
    // Body bytes after the XID: 0xff asks the server to withhold the
    // reply until well past the caller's timeout.
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let first = read_record(&mut stream).expect("read").expect("record");
        let second = read_record(&mut stream).expect("read").expect("record");
        let (slow, fast) = if first[4] == 0xff {
            (first, second)
        } else {
            (second, first)
        };
        write_record(&mut stream, &fast).expect("write fast");
        thread::sleep(Duration::from_millis(1500));
        write_record(&mut stream, &slow).expect("write slow");
        // Stay around to serve the follow-up request.
        while let Ok(Some(body)) = read_record(&mut stream) {
            if write_record(&mut stream, &body).is_err() {
                break;
            }
        }
    });

    let mgr = Arc::new(NetMgr::new(None).expect("netmgr"));
    let port = addr.port();

    let slow_mgr = Arc::clone(&mgr);
    let slow_caller = thread::spawn(move || {
        slow_mgr.send_and_wait(
            "127.0.0.1",
            port,
            false,
            request(1, &[0xff; 8]),
            Duration::from_millis(500),
        )
    });
    let fast_mgr = Arc::clone(&mgr);
    let fast_caller = thread::spawn(move || {
        fast_mgr.send_and_wait(
            "127.0.0.1",
            port,
            false,
            request(2, &[0x01; 8]),
            Duration::from_secs(10),
        )
    });

    let timed_out = slow_caller.join().expect("slow caller");
    assert!(matches!(
        timed_out,
        Err(RpcError::Timeout { xid: 1, .. })
    ));
    let completed = fast_caller.join().expect("fast caller").expect("fast reply");
    assert_eq!(completed.xid(), 2);

    // Let the withheld reply arrive; with its caller gone it is
    // discarded, and the connection keeps working.
    thread::sleep(Duration::from_millis(1500));
    let reply = mgr
        .send_and_wait(
            "127.0.0.1",
            port,
            false,
            request(3, b"follow-up"),
            Duration::from_secs(5),
        )
        .expect("follow-up reply");
    assert_eq!(reply.xid(), 3);
    assert_eq!(mgr.connections_created(), 1);
}

#[test]
fn peer_disconnect_gets_a_fresh_connection() {
    // One exchange per accepted connection, then hang up.
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");
    thread::spawn(move || loop {
        let (mut stream, _) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(_) => break,
        };
        if let Ok(Some(body)) = read_record(&mut stream) {
            let _ = write_record(&mut stream, &body);
        }
    });

    let mgr = NetMgr::new(None).expect("netmgr");
    mgr.send_and_wait(
        "127.0.0.1",
        addr.port(),
        false,
        request(10, b"first"),
        Duration::from_secs(5),
    )
    .expect("first reply");

    // Give the reader time to notice the hangup and drop the connection.
    thread::sleep(Duration::from_millis(400));

    mgr.send_and_wait(
        "127.0.0.1",
        addr.port(),
        false,
        request(11, b"second"),
        Duration::from_secs(5),
    )
    .expect("second reply");

    assert_eq!(mgr.connections_created(), 2);
}

#[test]
fn reply_dribbled_across_fragments_and_chunks() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let body = read_record(&mut stream).expect("read").expect("record");
        let half = body.len() / 2;

        // First fragment, with its payload split across flushes.
        stream
            .write_u32::<BigEndian>(half as u32)
            .expect("header one");
        stream.flush().expect("flush");
        thread::sleep(Duration::from_millis(30));
        stream.write_all(&body[..2]).expect("dribble");
        stream.flush().expect("flush");
        thread::sleep(Duration::from_millis(30));
        stream.write_all(&body[2..half]).expect("rest of one");
        stream.flush().expect("flush");
        thread::sleep(Duration::from_millis(30));

        // Last fragment.
        stream
            .write_u32::<BigEndian>(LAST_FRAG | (body.len() - half) as u32)
            .expect("header two");
        stream.write_all(&body[half..]).expect("fragment two");
        stream.flush().expect("flush");
    });

    let mgr = NetMgr::new(None).expect("netmgr");
    let body = b"0123456789abcdef";
    let reply = mgr
        .send_and_wait(
            "127.0.0.1",
            addr.port(),
            false,
            request(21, body),
            Duration::from_secs(5),
        )
        .expect("reply");
    assert_eq!(reply.xid(), 21);
    assert_eq!(&reply.as_slice()[4..], &body[..]);
}

#[test]
fn scatter_payload_request_round_trips() {
    let addr = spawn_echo_server();
    let mgr = NetMgr::new(None).expect("netmgr");

    // A segment exactly at the fragment bound forces the request onto
    // the wire as two fragments: the header range, then the payload.
    let payload = vec![0x5a; MTU_SIZE];
    let mut xdr = request(31, b"write");
    xdr.add_payload(Bytes::from(payload.clone()));

    let reply = mgr
        .send_and_wait(
            "127.0.0.1",
            addr.port(),
            false,
            xdr,
            Duration::from_secs(30),
        )
        .expect("reply");
    assert_eq!(reply.xid(), 31);
    assert_eq!(reply.len(), 4 + 5 + MTU_SIZE);
    assert_eq!(&reply.as_slice()[9..], &payload[..]);
}

#[test]
fn connect_refusal_is_a_connect_error() {
    // Bind and immediately drop to find a port with no listener.
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);

    let mgr = NetMgr::new(None).expect("netmgr");
    let result = mgr.send_and_wait(
        "127.0.0.1",
        addr.port(),
        false,
        request(41, b"nobody home"),
        Duration::from_secs(5),
    );
    assert!(matches!(result, Err(RpcError::Connect { .. })));
    // The failed connection is not left in the registry.
    assert_eq!(mgr.connection_count(), 0);
}

#[test]
fn shutdown_refuses_further_use() {
    let addr = spawn_echo_server();
    let mgr = NetMgr::new(None).expect("netmgr");

    mgr.send_and_wait(
        "127.0.0.1",
        addr.port(),
        false,
        request(51, b"ping"),
        Duration::from_secs(5),
    )
    .expect("reply");

    mgr.shutdown();
    assert_eq!(mgr.connection_count(), 0);

    let result = mgr.send_and_wait(
        "127.0.0.1",
        addr.port(),
        false,
        request(52, b"ping"),
        Duration::from_secs(5),
    );
    assert!(matches!(result, Err(RpcError::Shutdown)));
}
