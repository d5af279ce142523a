//! Host event loop
//!
//! The host thread owns every [`BrowserContext`]. Transports, the reader
//! monitor, reader sessions and the credential worker all post [`HostEvent`]s
//! into one channel; the host handles them strictly in order.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::Arc;
use std::thread;

use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};
use webeid_card::error::status_code;
use webeid_card::{CardError, ReaderEvent, ReaderList, ReaderMonitor, ReaderSession, SessionControl, SessionEvent};
use webeid_common::{CertificatePurpose, ContextId, Failure, VERSION};
use webeid_pki::{Dialogs, Operation, OperationOutput, OperationRequest, PkiHandle, PkiOutcome};

use crate::context::{BrowserContext, Pending, PendingKind};
use crate::protocol::{message_id, MessageType, Request, Response};
use crate::transport::{FrameError, Outbound, TransportKind};

/// Everything the host thread reacts to
pub enum HostEvent {
    /// A transport accepted a new connection
    Opened {
        context: ContextId,
        transport: TransportKind,
        outbound: Box<dyn Outbound>,
    },
    Message {
        context: ContextId,
        payload: Result<Map<String, Value>, FrameError>,
    },
    /// The peer went away
    Closed { context: ContextId },
    Reader(ReaderEvent),
    Pki(PkiOutcome),
    Session {
        context: ContextId,
        reader: String,
        event: SessionEvent,
    },
}

impl From<ReaderEvent> for HostEvent {
    fn from(event: ReaderEvent) -> Self {
        HostEvent::Reader(event)
    }
}

impl From<PkiOutcome> for HostEvent {
    fn from(outcome: PkiOutcome) -> Self {
        HostEvent::Pki(outcome)
    }
}

/// Read access to the reader list
pub trait ReaderDirectory: Send {
    fn list_readers(&self) -> ReaderList;

    fn shutdown(&mut self) {}
}

impl ReaderDirectory for ReaderMonitor {
    fn list_readers(&self) -> ReaderList {
        ReaderMonitor::list_readers(self)
    }

    fn shutdown(&mut self) {
        ReaderMonitor::shutdown(self)
    }
}

/// Stand-in when PC/SC is not available
pub struct NoReaders;

impl ReaderDirectory for NoReaders {
    fn list_readers(&self) -> ReaderList {
        ReaderList::new()
    }
}

/// How a rejected message affects its context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Severity {
    Recoverable,
    FatalOnPipe,
    Fatal,
}

type Rejection = (Failure, Severity);

pub struct Host {
    readers: Box<dyn ReaderDirectory>,
    pki: PkiHandle,
    dialogs: Arc<dyn Dialogs>,
    events: SyncSender<HostEvent>,
    contexts: HashMap<ContextId, BrowserContext>,
    exit_code: Option<i32>,
}

impl Host {
    pub fn new(
        readers: Box<dyn ReaderDirectory>,
        pki: PkiHandle,
        dialogs: Arc<dyn Dialogs>,
        events: SyncSender<HostEvent>,
    ) -> Self {
        Self {
            readers,
            pki,
            dialogs,
            events,
            contexts: HashMap::new(),
            exit_code: None,
        }
    }

    /// Process exit status, once the host decided to stop
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Handle events until the host decides to stop
    pub fn run(&mut self, events: Receiver<HostEvent>) -> i32 {
        for event in events.iter() {
            self.handle(event);
            if let Some(code) = self.exit_code {
                return code;
            }
        }
        self.exit_code.unwrap_or(0)
    }

    pub fn handle(&mut self, event: HostEvent) {
        match event {
            HostEvent::Opened {
                context,
                transport,
                outbound,
            } => {
                info!(context = %context, transport = ?transport, "Context opened");
                self.contexts
                    .insert(context, BrowserContext::new(context, transport, outbound));
            }
            HostEvent::Message { context, payload } => self.on_message(context, payload),
            HostEvent::Closed { context } => {
                if let Some(closed) = self.contexts.remove(&context) {
                    let transport = closed.transport;
                    closed.close();
                    if transport == TransportKind::Pipe {
                        self.exit_code.get_or_insert(0);
                    }
                }
            }
            HostEvent::Reader(event) => self.on_reader_event(event),
            HostEvent::Pki(outcome) => self.on_pki_outcome(outcome),
            HostEvent::Session {
                context,
                reader,
                event,
            } => self.on_session_event(context, reader, event),
        }
    }

    /// Close every context and stop the reader monitor
    pub fn shutdown(&mut self) {
        for (_, context) in self.contexts.drain() {
            context.close();
        }
        self.readers.shutdown();
    }

    fn teardown(&mut self, id: ContextId, code: i32) {
        if let Some(context) = self.contexts.remove(&id) {
            let transport = context.transport;
            context.close();
            if transport == TransportKind::Pipe {
                self.exit_code.get_or_insert(code);
            }
        }
    }

    fn on_message(&mut self, id: ContextId, payload: Result<Map<String, Value>, FrameError>) {
        let Some(context) = self.contexts.get_mut(&id) else {
            debug!(context = %id, "Message for a closed context");
            return;
        };

        let message = match payload {
            Ok(message) => message,
            Err(FrameError::Empty) => {
                warn!(context = %id, "Empty message");
                let response = Response::failure(&Failure::InvalidArgument("empty message".into()))
                    .with("version", VERSION);
                context.respond(None, response);
                if context.transport == TransportKind::Pipe {
                    self.teardown(id, 1);
                }
                return;
            }
            Err(e) => {
                warn!(context = %id, error = %e, "Unreadable message");
                context.respond(None, Response::failure(&Failure::InvalidArgument(e.to_string())));
                if context.transport == TransportKind::Pipe {
                    self.teardown(id, 1);
                }
                return;
            }
        };

        let request_id = message_id(&message).map(str::to_string);
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(id, message)))
            .unwrap_or_else(|_| {
                error!(context = %id, "Request handler panicked");
                Err((Failure::technical("internal error"), Severity::FatalOnPipe))
            });

        let Some(context) = self.contexts.get_mut(&id) else {
            return;
        };
        match result {
            Ok(Some(response)) => context.respond(request_id.as_deref(), response),
            Ok(None) => {}
            Err((failure, severity)) => {
                info!(context = %id, failure = %failure, "Request rejected");
                context.respond(request_id.as_deref(), Response::failure(&failure));
                let fatal = match severity {
                    Severity::Recoverable => false,
                    Severity::FatalOnPipe => context.transport == TransportKind::Pipe,
                    Severity::Fatal => true,
                };
                if fatal {
                    self.teardown(id, 1);
                }
            }
        }
    }

    /// Run one request; `None` means the answer comes later
    fn dispatch(&mut self, id: ContextId, message: Map<String, Value>) -> Result<Option<Response>, Rejection> {
        let request = Request::parse(message).map_err(|f| (f, Severity::FatalOnPipe))?;

        context_mut(&mut self.contexts, id)
            .and_then(|context| context.check_origin(&request.origin, request.lang.as_deref()))
            .map_err(|f| (f, Severity::Fatal))?;

        let kind: MessageType = request
            .kind
            .parse()
            .map_err(|f| (f, Severity::Recoverable))?;
        debug!(context = %id, id = %request.id, kind = %kind, "Dispatching");

        if !matches!(kind, MessageType::Version | MessageType::Readers) {
            context_mut(&mut self.contexts, id)
                .and_then(|context| context.ensure_idle(&request.id))
                .map_err(|f| (f, Severity::Recoverable))?;
        }

        let result = match kind {
            MessageType::Version => Ok(Some(Response::new().with("version", VERSION))),
            MessageType::Readers => Ok(Some(
                Response::new().with("readers", readers_value(&self.readers.list_readers())),
            )),
            MessageType::Cert | MessageType::Sign | MessageType::Auth => {
                self.credential(id, kind, &request).map(|()| None)
            }
            MessageType::Connect => self.connect(id, &request).map(|()| None),
            MessageType::Apdu => self.transmit(id, &request).map(|()| None),
            MessageType::Disconnect => self.disconnect(id, &request).map(|()| None),
        };
        result.map_err(|f| (f, Severity::Recoverable))
    }

    fn credential(&mut self, id: ContextId, kind: MessageType, request: &Request) -> Result<(), Failure> {
        let operation = match kind {
            MessageType::Cert => OperationRequest::SelectCertificate {
                purpose: request
                    .optional("filter")
                    .unwrap_or("SIGN")
                    .parse::<CertificatePurpose>()?,
            },
            MessageType::Sign => OperationRequest::Sign {
                certificate: request.bytes("cert")?,
                hash: request.bytes("hash")?,
                algorithm: request.required("hashtype")?.parse()?,
            },
            _ => OperationRequest::Authenticate {
                nonce: request.required("nonce")?.to_string(),
            },
        };

        let context = context_mut(&mut self.contexts, id)?;
        let origin = context
            .origin()
            .map(|origin| origin.value.clone())
            .ok_or(Failure::InvalidState)?;
        context.begin(&request.id, PendingKind::Credential)?;
        debug!(context = %id, id = %request.id, lang = context.locale().unwrap_or(""), "Starting operation");

        if let Err(failure) = self
            .pki
            .execute(Operation::new(id, request.id.clone(), origin, operation))
        {
            context.clear_pending();
            return Err(failure);
        }
        Ok(())
    }

    fn connect(&mut self, id: ContextId, request: &Request) -> Result<(), Failure> {
        let reader = match request.optional("reader").filter(|reader| !reader.is_empty()) {
            Some(reader) => reader.to_string(),
            None => first_card_reader(&self.readers.list_readers())
                .ok_or_else(|| Failure::InvalidArgument("no reader with a card".into()))?,
        };
        let protocol = request.optional("protocol").unwrap_or("*");

        if self.contexts.values().any(|context| context.has_session(&reader)) {
            return Err(CardError::InUse(reader).into());
        }

        let context = context_mut(&mut self.contexts, id)?;
        context.begin(
            &request.id,
            PendingKind::Connect {
                reader: reader.clone(),
            },
        )?;

        let events = self.events.clone();
        let name = reader.clone();
        let opened = ReaderSession::open(&reader, protocol, move |event| {
            let _ = events.send(HostEvent::Session {
                context: id,
                reader: name.clone(),
                event,
            });
        });

        match opened {
            Ok(session) => {
                context.insert_session(session);
                Ok(())
            }
            Err(e) => {
                context.clear_pending();
                Err(e.into())
            }
        }
    }

    fn transmit(&mut self, id: ContextId, request: &Request) -> Result<(), Failure> {
        let reader = request.required("reader")?.to_string();
        let apdu = request.bytes("bytes")?;

        let context = context_mut(&mut self.contexts, id)?;
        if !context.has_session(&reader) {
            return Err(CardError::NotConnected(reader).into());
        }
        context.begin(
            &request.id,
            PendingKind::Apdu {
                reader: reader.clone(),
            },
        )?;

        if let Err(e) = context.transmit(&reader, apdu) {
            context.clear_pending();
            return Err(e.into());
        }
        Ok(())
    }

    fn disconnect(&mut self, id: ContextId, request: &Request) -> Result<(), Failure> {
        let reader = request.required("reader")?.to_string();

        let context = context_mut(&mut self.contexts, id)?;
        if !context.has_session(&reader) {
            return Err(Failure::InvalidState);
        }
        context.begin(
            &request.id,
            PendingKind::Disconnect {
                reader: reader.clone(),
            },
        )?;
        context.disconnect(&reader);
        Ok(())
    }

    fn on_session_event(&mut self, id: ContextId, reader: String, event: SessionEvent) {
        let Some(context) = self.contexts.get_mut(&id) else {
            debug!(context = %id, reader = %reader, "Session event for a closed context");
            return;
        };

        match event {
            SessionEvent::Connected { protocol } => {
                let expected = PendingKind::Connect {
                    reader: reader.clone(),
                };
                if let Some(pending) = context.take_pending_if(|p| p.kind == expected) {
                    let response = Response::new()
                        .with("reader", reader.as_str())
                        .with("protocol", protocol);
                    context.respond(Some(&pending.id), response);
                }
                if let (Some(origin), Some(control)) = (context.origin(), context.session_control(&reader)) {
                    notify_reader_busy(self.dialogs.clone(), origin.friendly.clone(), reader, control);
                }
            }
            SessionEvent::Received(bytes) => {
                let expected = PendingKind::Apdu {
                    reader: reader.clone(),
                };
                match context.take_pending_if(|p| p.kind == expected) {
                    Some(pending) => {
                        context.respond(Some(&pending.id), Response::new().with("bytes", hex::encode(bytes)))
                    }
                    None => debug!(context = %id, reader = %reader, "Unrequested APDU response dropped"),
                }
            }
            SessionEvent::Disconnected(status) => {
                context.remove_session(&reader);
                let failure = status.map(|e| Failure::from(CardError::Pcsc(e)));

                match context.take_pending_if(|p| p.kind.reader() == Some(reader.as_str())) {
                    Some(Pending {
                        id: request,
                        kind: PendingKind::Disconnect { .. },
                    }) => {
                        let response = failure.as_ref().map(Response::failure).unwrap_or_default();
                        context.respond(Some(&request), response);
                    }
                    Some(pending) => {
                        let failure = failure.unwrap_or_else(|| Failure::technical("reader session ended"));
                        context.respond(Some(&pending.id), Response::failure(&failure));
                    }
                    None => {
                        let mut response = Response::unsolicited(MessageType::Disconnect).with("reader", reader.as_str());
                        if let Some(failure) = &failure {
                            response = response.with("result", failure.result_code().as_str());
                        }
                        context.respond(None, response);
                    }
                }
            }
        }
    }

    fn on_reader_event(&mut self, event: ReaderEvent) {
        match event {
            ReaderEvent::ReaderAttached { reader } => info!(reader = %reader, "Reader attached"),
            ReaderEvent::ReaderRemoved { reader } => info!(reader = %reader, "Reader removed"),
            ReaderEvent::CardInserted { reader, atr } => {
                info!(reader = %reader, "Card inserted");
                self.pki.refresh(&reader, &atr);
            }
            ReaderEvent::CardRemoved { reader } => {
                info!(reader = %reader, "Card removed");
                self.pki.invalidate(&reader);
            }
            ReaderEvent::ReaderListChanged { readers } => {
                let value = readers_value(&readers);
                for context in self
                    .contexts
                    .values_mut()
                    .filter(|c| c.transport == TransportKind::Socket && c.origin().is_some())
                {
                    let response = Response::unsolicited(MessageType::Readers).with("readers", value.clone());
                    context.respond(None, response);
                }
            }
            ReaderEvent::Error { reader, error } => {
                warn!(reader = ?reader, error = %error, code = status_code(error), "Reader error")
            }
        }
    }

    fn on_pki_outcome(&mut self, outcome: PkiOutcome) {
        let Some(context) = self.contexts.get_mut(&outcome.context) else {
            debug!(context = %outcome.context, id = %outcome.id, "Outcome for a closed context");
            return;
        };
        let Some(pending) =
            context.take_pending_if(|p| p.id == outcome.id && p.kind == PendingKind::Credential)
        else {
            warn!(context = %outcome.context, id = %outcome.id, "Outcome without a pending request");
            return;
        };

        let response = match outcome.result {
            Ok(OperationOutput::Certificate(der)) => Response::new().with("cert", hex::encode(der)),
            Ok(OperationOutput::Signature(signature)) => Response::new().with("signature", hex::encode(signature)),
            Ok(OperationOutput::Token(token)) => Response::new().with("token", token),
            Err(failure) => {
                info!(context = %outcome.context, id = %outcome.id, failure = %failure, "Operation failed");
                Response::failure(&failure)
            }
        };
        context.respond(Some(&pending.id), response);
    }
}

fn context_mut(
    contexts: &mut HashMap<ContextId, BrowserContext>,
    id: ContextId,
) -> Result<&mut BrowserContext, Failure> {
    contexts
        .get_mut(&id)
        .ok_or_else(|| Failure::technical(format!("unknown context {}", id)))
}

fn readers_value(readers: &ReaderList) -> Value {
    Value::Object(
        readers
            .iter()
            .map(|(name, states)| (name.clone(), Value::from(states.clone())))
            .collect(),
    )
}

/// First reader holding a responsive card
fn first_card_reader(readers: &ReaderList) -> Option<String> {
    readers
        .iter()
        .find(|(_, states)| states.contains(&"PRESENT") && !states.contains(&"MUTE"))
        .map(|(name, _)| name.clone())
}

/// Show the reader-in-use notice until the session ends
fn notify_reader_busy(dialogs: Arc<dyn Dialogs>, origin: String, reader: String, control: SessionControl) {
    let spawned = thread::Builder::new()
        .name(format!("busy-{}", reader))
        .spawn(move || {
            if dialogs.notify_reader_busy(&origin, &reader, control.open_flag()) && control.is_open() {
                info!(reader = %reader, origin = %origin, "Access ended by user");
                control.disconnect();
            }
        });
    if let Err(e) = spawned {
        warn!(error = %e, "Failed to start reader notice");
    }
}
