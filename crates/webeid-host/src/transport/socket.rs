//! Local socket transport
//!
//! Newline-delimited JSON over TCP. Every accepted connection is a separate
//! browser context that lives until the peer disconnects.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::mpsc::SyncSender;
use std::thread;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use webeid_common::ContextId;

use super::{parse_message, Outbound, TransportKind};
use crate::host::HostEvent;

struct SocketOutbound {
    stream: TcpStream,
}

impl Outbound for SocketOutbound {
    fn send(&mut self, message: &Map<String, Value>) -> io::Result<()> {
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        self.stream.write_all(&line)?;
        self.stream.flush()
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Bind `addr` and accept connections on a background thread
pub fn listen(addr: &str, events: SyncSender<HostEvent>) -> io::Result<()> {
    let listener = TcpListener::bind(addr)?;
    let local = listener.local_addr()?;
    if !local.ip().is_loopback() {
        warn!(addr = %local, "Listening on a non-loopback address");
    }
    info!(addr = %local, "Listening");

    thread::spawn(move || {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    if let Err(e) = accept(stream, events.clone()) {
                        warn!(error = %e, "Failed to accept connection");
                    }
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            }
        }
    });
    Ok(())
}

fn accept(stream: TcpStream, events: SyncSender<HostEvent>) -> io::Result<()> {
    let context = ContextId::new();
    let peer = stream.peer_addr()?;
    info!(context = %context, peer = %peer, "Connection accepted");

    let outbound = SocketOutbound {
        stream: stream.try_clone()?,
    };
    if events
        .send(HostEvent::Opened {
            context,
            transport: TransportKind::Socket,
            outbound: Box::new(outbound),
        })
        .is_err()
    {
        return Ok(());
    }

    thread::spawn(move || {
        for line in BufReader::new(stream).lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    debug!(context = %context, error = %e, "Read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let payload = parse_message(line.as_bytes());
            if events.send(HostEvent::Message { context, payload }).is_err() {
                break;
            }
        }
        let _ = events.send(HostEvent::Closed { context });
    });
    Ok(())
}
