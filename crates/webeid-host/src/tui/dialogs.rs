use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crossterm::event::KeyCode;
use ratatui::widgets::ListState;
use secrecy::SecretString;
use tracing::{debug, info, warn};
use webeid_common::{Certificate, CertificatePurpose};
use webeid_pki::{Dialogs, Outcome, PinRequest, PinStatus, PkiError};

use super::events::{is_cancel_key, DialogEvent, EventHandler};
use super::terminal::Tty;
use super::ui::{self, PinView};

const TICK_RATE: Duration = Duration::from_millis(250);
const MAX_PIN_LEN: usize = 12;

/// Dialogs on the controlling terminal
///
/// Only one dialog owns the terminal at a time; the reader-in-use notice
/// keeps it for as long as the session is open.
#[derive(Default)]
pub struct TerminalDialogs {
    tty: Mutex<()>,
}

impl TerminalDialogs {
    pub fn new() -> Self {
        Self::default()
    }

    fn claim(&self) -> MutexGuard<'_, ()> {
        self.tty.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn dialog_error(error: std::io::Error) -> PkiError {
    PkiError::Dialog(error.to_string())
}

/// Line shown under the PIN field
fn pin_warning(request: &PinRequest<'_>) -> Option<String> {
    if request.final_try {
        return Some("Last attempt: a wrong PIN blocks the card".into());
    }
    match request.last_error {
        Some(PkiError::PinIncorrect) => Some("Incorrect PIN, try again".into()),
        Some(error) => Some(error.to_string()),
        None if request.token.pin_status == PinStatus::CountLow => {
            Some("The PIN was entered incorrectly before".into())
        }
        None => None,
    }
}

fn purpose_label(purpose: CertificatePurpose) -> &'static str {
    match purpose {
        CertificatePurpose::Signing => "signing",
        _ => "authentication",
    }
}

impl Dialogs for TerminalDialogs {
    fn prompt_pin(&self, request: &PinRequest<'_>) -> Result<Outcome<SecretString>, PkiError> {
        let _claim = self.claim();
        let mut tty = Tty::open().map_err(dialog_error)?;
        let events = EventHandler::new(TICK_RATE);
        let warning = pin_warning(request);
        let mut pin = String::new();

        debug!(origin = request.origin, token = %request.token.label, "Prompting for PIN");
        loop {
            let view = PinView {
                origin: request.origin,
                token: &request.token.label,
                purpose: purpose_label(request.purpose),
                entered: pin.chars().count(),
                warning: warning.as_deref(),
                final_try: request.final_try,
            };
            tty.terminal()
                .draw(|frame| ui::render_pin(frame, &view))
                .map_err(dialog_error)?;

            match events.next().map_err(dialog_error)? {
                DialogEvent::Key(key) if is_cancel_key(&key) => return Ok(Outcome::Cancelled),
                DialogEvent::Key(key) => match key.code {
                    KeyCode::Char(c) if !c.is_control() && pin.chars().count() < MAX_PIN_LEN => pin.push(c),
                    KeyCode::Backspace => {
                        pin.pop();
                    }
                    KeyCode::Enter if !pin.is_empty() => {
                        return Ok(Outcome::Accepted(SecretString::new(std::mem::take(&mut pin))));
                    }
                    _ => {}
                },
                DialogEvent::Interrupt => return Ok(Outcome::Cancelled),
                DialogEvent::Tick => {}
            }
        }
    }

    fn select_certificate(
        &self,
        origin: &str,
        candidates: &[Certificate],
        purpose: CertificatePurpose,
    ) -> Result<Outcome<usize>, PkiError> {
        if candidates.is_empty() {
            return Ok(Outcome::Cancelled);
        }

        let _claim = self.claim();
        let mut tty = Tty::open().map_err(dialog_error)?;
        let events = EventHandler::new(TICK_RATE);
        let items: Vec<String> = candidates
            .iter()
            .map(|c| format!("{} - {} ({})", c.subject, purpose_label(purpose), c.reader))
            .collect();
        let mut state = ListState::default().with_selected(Some(0));

        loop {
            tty.terminal()
                .draw(|frame| ui::render_picker(frame, origin, &items, &mut state))
                .map_err(dialog_error)?;

            let selected = state.selected().unwrap_or(0);
            match events.next().map_err(dialog_error)? {
                DialogEvent::Key(key) if is_cancel_key(&key) => return Ok(Outcome::Cancelled),
                DialogEvent::Key(key) => match key.code {
                    KeyCode::Up | KeyCode::Char('k') => state.select(Some(selected.saturating_sub(1))),
                    KeyCode::Down | KeyCode::Char('j') => {
                        state.select(Some((selected + 1).min(items.len() - 1)))
                    }
                    KeyCode::Enter => {
                        info!(origin, subject = %candidates[selected].subject, "Certificate selected");
                        return Ok(Outcome::Accepted(selected));
                    }
                    _ => {}
                },
                DialogEvent::Interrupt => return Ok(Outcome::Cancelled),
                DialogEvent::Tick => {}
            }
        }
    }

    fn notify_reader_busy(&self, origin: &str, reader: &str, open: &AtomicBool) -> bool {
        let _claim = self.claim();
        if !open.load(Ordering::SeqCst) {
            return false;
        }
        let mut tty = match Tty::open() {
            Ok(tty) => tty,
            Err(e) => {
                warn!(error = %e, reader, "Cannot show reader notice");
                return false;
            }
        };
        let events = EventHandler::new(TICK_RATE);

        while open.load(Ordering::SeqCst) {
            if let Err(e) = tty.terminal().draw(|frame| ui::render_busy(frame, origin, reader)) {
                warn!(error = %e, "Reader notice failed");
                return false;
            }
            match events.next() {
                Ok(DialogEvent::Key(key)) if is_cancel_key(&key) => return true,
                Ok(DialogEvent::Interrupt) => return true,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Reader notice failed");
                    return false;
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webeid_pki::TokenInfo;

    fn request<'a>(token: &'a TokenInfo, last_error: Option<&'a PkiError>, final_try: bool) -> PinRequest<'a> {
        PinRequest {
            origin: "example.com",
            token,
            purpose: CertificatePurpose::Signing,
            last_error,
            final_try,
        }
    }

    #[test]
    fn test_pin_warnings() {
        let mut token = TokenInfo {
            label: "PIN2".into(),
            serial: "1".into(),
            pin_status: PinStatus::Ok,
        };
        assert_eq!(pin_warning(&request(&token, None, false)), None);

        let incorrect = PkiError::PinIncorrect;
        assert_eq!(
            pin_warning(&request(&token, Some(&incorrect), false)).as_deref(),
            Some("Incorrect PIN, try again")
        );
        assert!(pin_warning(&request(&token, Some(&incorrect), true))
            .unwrap()
            .starts_with("Last attempt"));

        token.pin_status = PinStatus::CountLow;
        assert!(pin_warning(&request(&token, None, false)).is_some());
    }

    #[test]
    fn test_closed_session_needs_no_notice() {
        let dialogs = TerminalDialogs::new();
        assert!(!dialogs.notify_reader_busy("example.com", "Reader 0", &AtomicBool::new(false)));
    }
}
