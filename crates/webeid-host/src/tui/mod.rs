//! Terminal dialogs
//!
//! PIN entry, certificate selection and the reader-in-use notice, drawn with
//! ratatui on the controlling terminal. Stdin and stdout belong to the
//! browser, so the terminal is opened separately.

mod dialogs;
mod events;
mod terminal;
mod ui;

pub use dialogs::TerminalDialogs;
