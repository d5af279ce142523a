//! Web eID Card - PC/SC reader monitoring and card sessions
//!
//! This crate watches all smart card readers of the platform on a background
//! thread, reports attach/insert/remove events in the order they were seen,
//! and opens shared-mode sessions for exchanging APDUs with a card.

pub mod apdu;
pub mod error;
pub mod monitor;
pub mod reader;
pub mod session;

pub use error::CardError;
pub use monitor::{MonitorConfig, ReaderMonitor};
pub use reader::{state_names, ReaderEvent, ReaderList};
pub use session::{ProtocolHint, ReaderSession, SessionControl, SessionEvent, SessionState};

/// Re-export commonly used types
pub use pcsc::Error as PcscError;
