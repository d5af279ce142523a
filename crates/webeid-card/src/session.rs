//! Reader sessions
//!
//! A session owns one shared-mode connection to one reader, with a card
//! transaction held for its whole lifetime. Each session runs on its own
//! worker thread so connect, transmit and disconnect against a handle are
//! always serialized.

use std::ffi::CString;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use pcsc::{Card, Context, Disposition, Protocol, Protocols, Scope, ShareMode};
use tracing::{debug, info, warn};

use crate::apdu::{validate_command, ApduResponse, MAX_RESPONSE_LEN};
use crate::error::CardError;

/// Platforms where card transactions are used around a session
const USE_TRANSACTIONS: bool = cfg!(not(windows));

/// Protocol requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolHint {
    T0,
    T1,
    Any,
}

impl ProtocolHint {
    fn protocols(self) -> Protocols {
        match self {
            ProtocolHint::T0 => Protocols::T0,
            ProtocolHint::T1 => Protocols::T1,
            ProtocolHint::Any => Protocols::T0 | Protocols::T1,
        }
    }
}

impl FromStr for ProtocolHint {
    type Err = CardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "T=0" => Ok(ProtocolHint::T0),
            "T=1" => Ok(ProtocolHint::T1),
            "*" => Ok(ProtocolHint::Any),
            other => Err(CardError::InvalidProtocol(other.to_string())),
        }
    }
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Events reported by a session worker
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Connected with the negotiated protocol
    Connected { protocol: &'static str },
    /// Response APDU, including the status word
    Received(Vec<u8>),
    /// Session ended; carries the PC/SC status when it ended with an error
    Disconnected(Option<pcsc::Error>),
}

enum SessionCommand {
    Transmit(Vec<u8>),
    Disconnect,
}

/// Cloneable control for ending a session from another thread
#[derive(Clone)]
pub struct SessionControl {
    commands: Sender<SessionCommand>,
    open: Arc<AtomicBool>,
}

impl SessionControl {
    /// Request disconnection
    pub fn disconnect(&self) {
        let _ = self.commands.send(SessionCommand::Disconnect);
    }

    /// Whether the session is still connecting or connected
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Flag cleared when the session ends
    pub fn open_flag(&self) -> &AtomicBool {
        &self.open
    }
}

/// Handle to one reader session
pub struct ReaderSession {
    reader: String,
    state: Arc<Mutex<SessionState>>,
    control: SessionControl,
    handle: Option<JoinHandle<()>>,
}

impl ReaderSession {
    /// Start connecting to `reader`
    ///
    /// An invalid protocol hint fails here, before any hardware is touched.
    /// The outcome of the connection arrives as a [`SessionEvent`] passed
    /// through `emit`.
    pub fn open<F>(reader: &str, protocol: &str, emit: F) -> Result<Self, CardError>
    where
        F: Fn(SessionEvent) + Send + 'static,
    {
        let hint: ProtocolHint = protocol.parse()?;
        let name = CString::new(reader).map_err(|_| CardError::InvalidProtocol(reader.to_string()))?;

        let (commands, command_rx) = mpsc::channel();
        let state = Arc::new(Mutex::new(SessionState::Connecting));
        let open = Arc::new(AtomicBool::new(true));

        let worker = SessionWorker {
            reader: reader.to_string(),
            name,
            hint,
            commands: command_rx,
            state: state.clone(),
            open: open.clone(),
        };
        let handle = thread::spawn(move || worker.run(emit));

        Ok(Self {
            reader: reader.to_string(),
            state,
            control: SessionControl { commands, open },
            handle: Some(handle),
        })
    }

    pub fn reader(&self) -> &str {
        &self.reader
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn control(&self) -> SessionControl {
        self.control.clone()
    }

    /// Queue an APDU; only valid while connected
    pub fn transmit(&self, apdu: Vec<u8>) -> Result<(), CardError> {
        validate_command(&apdu)?;
        if self.state() != SessionState::Connected {
            return Err(CardError::NotConnected(self.reader.clone()));
        }
        self.control
            .commands
            .send(SessionCommand::Transmit(apdu))
            .map_err(|_| CardError::WorkerGone(self.reader.clone()))
    }

    /// Request disconnection; completion is reported as `Disconnected`
    pub fn disconnect(&self) {
        self.control.disconnect();
    }

    /// Disconnect and wait for the worker to release the reader
    pub fn close(mut self) {
        self.control.disconnect();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(reader = %self.reader, "Session worker panicked");
            }
        }
    }
}

struct SessionWorker {
    reader: String,
    name: CString,
    hint: ProtocolHint,
    commands: Receiver<SessionCommand>,
    state: Arc<Mutex<SessionState>>,
    open: Arc<AtomicBool>,
}

impl SessionWorker {
    fn set_state(&self, state: SessionState) {
        debug!(reader = %self.reader, state = %state, "Session state");
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    fn run<F: Fn(SessionEvent)>(self, emit: F) {
        // Context per session thread
        let context = match Context::establish(Scope::User) {
            Ok(context) => context,
            Err(e) => return self.fail(e, &emit),
        };

        info!(reader = %self.reader, "Connecting in shared mode");
        let mut card = match context.connect(&self.name, ShareMode::Shared, self.hint.protocols()) {
            Ok(card) => card,
            Err(e) => return self.fail(e, &emit),
        };

        let outcome = self.serve(&mut card, &emit);

        let disposition_status = match card.disconnect(Disposition::ResetCard) {
            Ok(()) => None,
            Err((_, e)) => Some(e),
        };

        match outcome {
            Ok(()) => {
                self.set_state(SessionState::Idle);
                self.open.store(false, Ordering::SeqCst);
                info!(reader = %self.reader, "Disconnected");
                emit(SessionEvent::Disconnected(disposition_status));
            }
            Err(e) => self.fail(e, &emit),
        }
    }

    /// Hold the transaction and serve commands until disconnect or failure
    fn serve<F: Fn(SessionEvent)>(&self, card: &mut Card, emit: &F) -> Result<(), pcsc::Error> {
        let protocol = negotiated_protocol(card);

        if USE_TRANSACTIONS {
            let transaction = card.transaction()?;
            self.connected(protocol, emit);
            self.serve_commands(&transaction, emit)?;
            if let Err((_, e)) = transaction.end(Disposition::LeaveCard) {
                warn!(reader = %self.reader, error = %e, "SCardEndTransaction failed");
            }
            Ok(())
        } else {
            self.connected(protocol, emit);
            self.serve_commands(card, emit)
        }
    }

    fn connected<F: Fn(SessionEvent)>(&self, protocol: &'static str, emit: &F) {
        info!(reader = %self.reader, protocol, "Connected");
        self.set_state(SessionState::Connected);
        emit(SessionEvent::Connected { protocol });
    }

    fn serve_commands<F: Fn(SessionEvent)>(&self, card: &Card, emit: &F) -> Result<(), pcsc::Error> {
        let mut buffer = vec![0u8; MAX_RESPONSE_LEN];
        for command in self.commands.iter() {
            match command {
                SessionCommand::Transmit(apdu) => {
                    let response = card.transmit(&apdu, &mut buffer)?;
                    if let Some(parsed) = ApduResponse::parse(response) {
                        debug!(reader = %self.reader, sw = %parsed.status_string(), len = parsed.data.len(), "Received");
                    }
                    emit(SessionEvent::Received(response.to_vec()));
                }
                SessionCommand::Disconnect => break,
            }
        }
        Ok(())
    }

    fn fail<F: Fn(SessionEvent)>(&self, error: pcsc::Error, emit: &F) {
        warn!(reader = %self.reader, error = %error, "Session failed");
        self.set_state(SessionState::Failed);
        self.open.store(false, Ordering::SeqCst);
        emit(SessionEvent::Disconnected(Some(error)));
    }
}

fn negotiated_protocol(card: &Card) -> &'static str {
    match card.status2_owned().ok().and_then(|status| status.protocol2()) {
        Some(Protocol::T0) => "T=0",
        Some(Protocol::T1) => "T=1",
        _ => "RAW",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_hints() {
        assert_eq!("T=0".parse::<ProtocolHint>().unwrap(), ProtocolHint::T0);
        assert_eq!("T=1".parse::<ProtocolHint>().unwrap(), ProtocolHint::T1);
        assert_eq!("*".parse::<ProtocolHint>().unwrap(), ProtocolHint::Any);
        assert_eq!(
            ProtocolHint::Any.protocols(),
            Protocols::T0 | Protocols::T1
        );
    }

    #[test]
    fn test_invalid_hint_fails_before_hardware() {
        let result = ReaderSession::open("Reader 0", "T=2", |_| {});
        assert!(matches!(result, Err(CardError::InvalidProtocol(p)) if p == "T=2"));
    }
}
