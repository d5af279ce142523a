//! Native messaging on stdin/stdout
//!
//! Each message is a 4-byte native-endian length followed by that many bytes
//! of UTF-8 JSON, in both directions.

use std::io::{self, Read, Write};
use std::sync::mpsc::SyncSender;
use std::thread;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use webeid_common::ContextId;

use super::{parse_message, FrameError, Outbound, TransportKind};
use crate::host::HostEvent;

/// Largest message accepted in either direction
pub const MAX_MESSAGE_LEN: usize = 1024 * 1024;

/// Whether stdin is a pipe, as set up by a browser
#[cfg(unix)]
pub fn stdin_is_pipe() -> bool {
    use std::os::fd::AsFd;
    is_fifo(io::stdin().as_fd())
}

#[cfg(not(unix))]
pub fn stdin_is_pipe() -> bool {
    use std::io::IsTerminal;
    !io::stdin().is_terminal()
}

#[cfg(unix)]
fn is_fifo(fd: std::os::fd::BorrowedFd<'_>) -> bool {
    use std::os::unix::fs::FileTypeExt;
    fd.try_clone_to_owned()
        .map(std::fs::File::from)
        .and_then(|file| file.metadata())
        .map(|metadata| metadata.file_type().is_fifo())
        .unwrap_or(false)
}

/// Read until `buf` is full or input ends; returns the bytes read
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Read one frame; `None` at end of input between frames
///
/// Input ending inside a frame is a malformed frame.
pub fn read_frame(reader: &mut impl Read) -> io::Result<Option<Result<Map<String, Value>, FrameError>>> {
    let mut header = [0u8; 4];
    match fill(reader, &mut header)? {
        0 => return Ok(None),
        4 => {}
        n => {
            return Ok(Some(Err(FrameError::Malformed(format!(
                "input ended after {} of 4 length bytes",
                n
            )))))
        }
    }

    let len = u32::from_ne_bytes(header) as usize;
    if len > MAX_MESSAGE_LEN {
        return Ok(Some(Err(FrameError::TooLarge(len))));
    }

    let mut body = vec![0u8; len];
    let read = fill(reader, &mut body)?;
    if read < len {
        return Ok(Some(Err(FrameError::Malformed(format!(
            "input ended after {} of {} message bytes",
            read, len
        )))));
    }
    Ok(Some(parse_message(&body)))
}

/// Write one frame and flush
pub fn write_frame(writer: &mut impl Write, message: &Map<String, Value>) -> io::Result<()> {
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_MESSAGE_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("response of {} bytes exceeds the limit", body.len()),
        ));
    }
    writer.write_all(&(body.len() as u32).to_ne_bytes())?;
    writer.write_all(&body)?;
    writer.flush()
}

struct PipeOutbound {
    stdout: io::Stdout,
}

impl Outbound for PipeOutbound {
    fn send(&mut self, message: &Map<String, Value>) -> io::Result<()> {
        debug!(len = message.len(), "Writing response");
        write_frame(&mut self.stdout.lock(), message)
    }

    fn close(&mut self) {
        let _ = self.stdout.flush();
    }
}

/// Open the single pipe context and start reading stdin
pub fn spawn(events: SyncSender<HostEvent>) -> ContextId {
    let context = ContextId::new();
    let _ = events.send(HostEvent::Opened {
        context,
        transport: TransportKind::Pipe,
        outbound: Box::new(PipeOutbound { stdout: io::stdout() }),
    });

    thread::spawn(move || {
        let mut stdin = io::stdin().lock();
        loop {
            match read_frame(&mut stdin) {
                Ok(Some(payload)) => {
                    // The host ends the pipe context on any unreadable frame
                    let stop = payload.is_err();
                    if events.send(HostEvent::Message { context, payload }).is_err() || stop {
                        break;
                    }
                }
                Ok(None) => {
                    info!("End of input");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    break;
                }
            }
        }
        let _ = events.send(HostEvent::Closed { context });
    });

    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(body: &[u8]) -> Vec<u8> {
        let mut out = (body.len() as u32).to_ne_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn test_read_frames_until_eof() {
        let mut input = frame(br#"{"id":"1","type":"VERSION"}"#);
        input.extend(frame(b""));
        let mut reader = input.as_slice();

        let first = read_frame(&mut reader).unwrap().unwrap().unwrap();
        assert_eq!(first["type"], "VERSION");
        assert!(matches!(read_frame(&mut reader).unwrap(), Some(Err(FrameError::Empty))));
        assert!(read_frame(&mut reader).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame() {
        let input = ((MAX_MESSAGE_LEN + 1) as u32).to_ne_bytes();
        let mut reader = &input[..];
        assert!(matches!(
            read_frame(&mut reader).unwrap(),
            Some(Err(FrameError::TooLarge(_)))
        ));
    }

    #[test]
    fn test_short_body_is_malformed() {
        let mut input = 10u32.to_ne_bytes().to_vec();
        input.extend_from_slice(br#"{"i"#);
        let mut reader = input.as_slice();
        assert!(matches!(
            read_frame(&mut reader).unwrap(),
            Some(Err(FrameError::Malformed(_)))
        ));
    }

    #[test]
    fn test_partial_header_is_malformed() {
        let mut reader: &[u8] = &[0x0a, 0x00];
        assert!(matches!(
            read_frame(&mut reader).unwrap(),
            Some(Err(FrameError::Malformed(_)))
        ));
    }

    #[test]
    fn test_eof_between_frames_is_clean() {
        let input = frame(br#"{"id":"1"}"#);
        let mut reader = input.as_slice();
        assert!(read_frame(&mut reader).unwrap().unwrap().is_ok());
        assert!(read_frame(&mut reader).unwrap().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_only_pipes_count_as_fifo() {
        use std::os::fd::AsFd;
        use std::process::{Command, Stdio};

        let mut child = Command::new("true").stdout(Stdio::piped()).spawn().unwrap();
        let stdout = child.stdout.take().unwrap();
        assert!(is_fifo(stdout.as_fd()));
        drop(stdout);
        child.wait().unwrap();

        let file = std::fs::File::open(std::env::current_exe().unwrap()).unwrap();
        assert!(!is_fifo(file.as_fd()));
    }

    #[test]
    fn test_write_frame() {
        let message = match json!({"id": "1", "result": "ok"}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let mut out = Vec::new();
        write_frame(&mut out, &message).unwrap();

        let body = br#"{"id":"1","result":"ok"}"#;
        assert_eq!(&out[..4], &(body.len() as u32).to_ne_bytes());
        assert_eq!(&out[4..], body);
    }
}
