use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use std::time::Duration;

/// Events that can occur while a dialog is shown
#[derive(Debug)]
pub enum DialogEvent {
    /// User pressed a key
    Key(KeyEvent),
    /// Tick event for periodic redraws
    Tick,
    /// Ctrl-C
    Interrupt,
}

/// Event handler for the dialogs
pub struct EventHandler {
    tick_rate: Duration,
}

impl EventHandler {
    pub fn new(tick_rate: Duration) -> Self {
        Self { tick_rate }
    }

    /// Wait for the next event
    pub fn next(&self) -> std::io::Result<DialogEvent> {
        if event::poll(self.tick_rate)? {
            match event::read()? {
                Event::Key(key) if key.kind == KeyEventKind::Press => {
                    if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
                        return Ok(DialogEvent::Interrupt);
                    }
                    Ok(DialogEvent::Key(key))
                }
                _ => Ok(DialogEvent::Tick),
            }
        } else {
            Ok(DialogEvent::Tick)
        }
    }
}

/// Check if the user wants to dismiss the dialog
pub fn is_cancel_key(key: &KeyEvent) -> bool {
    matches!(key.code, KeyCode::Esc)
}
