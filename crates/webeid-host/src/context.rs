//! Browser contexts
//!
//! A context is one browser-side connection. It is pinned to the origin of
//! its first valid message, has at most one request in flight and owns the
//! reader sessions it opened.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use webeid_card::{CardError, ReaderSession, SessionControl};
use webeid_common::{ContextId, Failure};

use crate::origin::Origin;
use crate::protocol::Response;
use crate::transport::{Outbound, TransportKind};

/// What the in-flight request is waiting for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingKind {
    /// CERT, SIGN or AUTH on the credential worker
    Credential,
    Connect { reader: String },
    Apdu { reader: String },
    Disconnect { reader: String },
}

impl PendingKind {
    /// Reader a session request is for
    pub fn reader(&self) -> Option<&str> {
        match self {
            PendingKind::Credential => None,
            PendingKind::Connect { reader }
            | PendingKind::Apdu { reader }
            | PendingKind::Disconnect { reader } => Some(reader),
        }
    }
}

/// The request a context is waiting to answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pending {
    pub id: String,
    pub kind: PendingKind,
}

pub struct BrowserContext {
    pub id: ContextId,
    pub transport: TransportKind,
    outbound: Box<dyn Outbound>,
    origin: Option<Origin>,
    locale: Option<String>,
    pending: Option<Pending>,
    sessions: BTreeMap<String, ReaderSession>,
}

impl BrowserContext {
    pub fn new(id: ContextId, transport: TransportKind, outbound: Box<dyn Outbound>) -> Self {
        Self {
            id,
            transport,
            outbound,
            origin: None,
            locale: None,
            pending: None,
            sessions: BTreeMap::new(),
        }
    }

    pub fn origin(&self) -> Option<&Origin> {
        self.origin.as_ref()
    }

    pub fn locale(&self) -> Option<&str> {
        self.locale.as_deref()
    }

    /// Pin the origin on the first message, then require an exact match
    ///
    /// The locale is taken from the message that pins the origin only.
    pub fn check_origin(&mut self, claim: &str, lang: Option<&str>) -> Result<(), Failure> {
        match &self.origin {
            Some(origin) if origin.value == claim => Ok(()),
            Some(origin) => Err(Failure::InvalidArgument(format!(
                "origin {:?} does not match {:?}",
                claim, origin.value
            ))),
            None => {
                let origin = Origin::parse(claim)?;
                info!(context = %self.id, origin = %origin.value, "Origin pinned");
                self.origin = Some(origin);
                if let Some(lang) = lang {
                    debug!(context = %self.id, lang, "Locale set");
                    self.locale = Some(lang.to_string());
                }
                Ok(())
            }
        }
    }

    /// Fail with `InvalidState` while a request is in flight
    pub fn ensure_idle(&self, id: &str) -> Result<(), Failure> {
        match &self.pending {
            Some(pending) => {
                debug!(context = %self.id, busy = %pending.id, rejected = id, "Request already in flight");
                Err(Failure::InvalidState)
            }
            None => Ok(()),
        }
    }

    /// Mark a request as in flight; fails if one already is
    pub fn begin(&mut self, id: &str, kind: PendingKind) -> Result<(), Failure> {
        self.ensure_idle(id)?;
        self.pending = Some(Pending {
            id: id.to_string(),
            kind,
        });
        Ok(())
    }

    /// Take the in-flight request if `matches` accepts it
    pub fn take_pending_if(&mut self, matches: impl FnOnce(&Pending) -> bool) -> Option<Pending> {
        if self.pending.as_ref().map_or(false, matches) {
            self.pending.take()
        } else {
            None
        }
    }

    pub fn clear_pending(&mut self) {
        self.pending = None;
    }

    /// Write a message as is
    pub fn send(&mut self, message: &Map<String, Value>) {
        if let Err(e) = self.outbound.send(message) {
            warn!(context = %self.id, error = %e, "Failed to write message");
        }
    }

    /// Write `response` enveloped with `id`
    pub fn respond(&mut self, id: Option<&str>, response: Response) {
        let message = response.envelope(id);
        debug!(
            context = %self.id,
            id = id.unwrap_or(""),
            result = message.get("result").and_then(serde_json::Value::as_str).unwrap_or(""),
            "Responding"
        );
        self.send(&message);
    }

    pub fn has_session(&self, reader: &str) -> bool {
        self.sessions.contains_key(reader)
    }

    pub fn insert_session(&mut self, session: ReaderSession) {
        self.sessions.insert(session.reader().to_string(), session);
    }

    pub fn session_control(&self, reader: &str) -> Option<SessionControl> {
        self.sessions.get(reader).map(ReaderSession::control)
    }

    pub fn transmit(&self, reader: &str, apdu: Vec<u8>) -> Result<(), CardError> {
        self.sessions
            .get(reader)
            .ok_or_else(|| CardError::NotConnected(reader.to_string()))?
            .transmit(apdu)
    }

    /// Ask the session for `reader` to disconnect
    pub fn disconnect(&self, reader: &str) {
        if let Some(session) = self.sessions.get(reader) {
            session.disconnect();
        }
    }

    /// Forget a session that reported its end and reap its worker
    pub fn remove_session(&mut self, reader: &str) {
        if let Some(session) = self.sessions.remove(reader) {
            session.close();
        }
    }

    /// Disconnect every session, then close the transport
    pub fn close(mut self) {
        info!(context = %self.id, sessions = self.sessions.len(), "Closing context");
        for (_, session) in std::mem::take(&mut self.sessions) {
            session.close();
        }
        self.outbound.close();
    }
}
