//! PC/SC reader monitor
//!
//! Owns the platform smart card context and runs a blocking
//! wait-for-change loop across all readers on a dedicated thread. Events are
//! posted to the owner's channel; other threads only read the reader map via
//! [`ReaderMonitor::list_readers`].

use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use pcsc::{Context, ReaderState, Scope, State, PNP_NOTIFICATION};
use tracing::{debug, error, info, warn};

use crate::error::CardError;
use crate::reader::{snapshot, Observation, ReaderEvent, ReaderList, ReaderTracker, SharedReaders};

/// Pause between repeated cancels while shutting down
const CANCEL_RETRY: Duration = Duration::from_millis(50);

/// Timing of the monitor loop
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Upper bound of one status-change wait, forces periodic re-validation
    pub poll_timeout: Duration,
    /// Wait between full re-listings when plug-and-play is not available
    pub relist_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(600),
            relist_interval: Duration::from_secs(2),
        }
    }
}

/// Handle to the background reader monitor
pub struct ReaderMonitor {
    context: Context,
    readers: SharedReaders,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ReaderMonitor {
    /// Establish a PC/SC context and start polling on a new thread
    pub fn spawn<E>(config: MonitorConfig, events: SyncSender<E>) -> Result<Self, CardError>
    where
        E: From<ReaderEvent> + Send + 'static,
    {
        let context = Context::establish(Scope::User)?;
        let readers = SharedReaders::default();
        let stop = Arc::new(AtomicBool::new(false));

        let worker = MonitorWorker {
            context: context.clone(),
            config,
            tracker: ReaderTracker::new(readers.clone()),
            stop: stop.clone(),
            events,
        };
        let handle = thread::spawn(move || worker.run());

        Ok(Self {
            context,
            readers,
            stop,
            handle: Some(handle),
        })
    }

    /// Snapshot of all known readers and their states; never touches hardware
    pub fn list_readers(&self) -> ReaderList {
        snapshot(&self.readers)
    }

    /// Make the current status-change wait return promptly
    pub fn cancel(&self) {
        if let Err(e) = self.context.cancel() {
            debug!(error = %e, "SCardCancel failed");
        }
    }

    /// Stop the poll loop and wait for the thread to finish
    ///
    /// A cancel issued before the worker enters its wait is lost, so it is
    /// repeated until the thread is gone.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            while !handle.is_finished() {
                self.cancel();
                thread::sleep(CANCEL_RETRY);
            }
            if handle.join().is_err() {
                warn!("Reader monitor thread panicked");
            }
        }
    }
}

struct MonitorWorker<E> {
    context: Context,
    config: MonitorConfig,
    tracker: ReaderTracker,
    stop: Arc<AtomicBool>,
    events: SyncSender<E>,
}

impl<E> MonitorWorker<E>
where
    E: From<ReaderEvent> + Send + 'static,
{
    fn run(mut self) {
        info!("Reader monitor started");

        let pnp = self.probe_pnp();
        let mut relist = true;
        let mut pnp_state = State::UNAWARE;
        let mut events = Vec::new();

        while !self.stop.load(Ordering::SeqCst) {
            if relist {
                match self.list_readers() {
                    Ok(listed) => self.tracker.reconcile(&listed, &mut events),
                    Err(e) => {
                        error!(error = %e, "SCardListReaders failed");
                        events.push(ReaderEvent::Error {
                            reader: None,
                            error: e,
                        });
                        break;
                    }
                }
                relist = false;
            }

            let mut states: Vec<ReaderState> = self
                .tracker
                .known()
                .into_iter()
                .filter_map(|(name, state)| {
                    CString::new(name).ok().map(|name| ReaderState::new(name, state))
                })
                .collect();
            if pnp {
                if cfg!(target_os = "macos") {
                    pnp_state = State::UNAWARE;
                }
                states.push(ReaderState::new(PNP_NOTIFICATION(), pnp_state));
            }

            if !self.flush(&mut events) {
                return;
            }

            if states.is_empty() {
                // Nothing to wait on, poll the reader list
                thread::sleep(self.config.relist_interval);
                relist = true;
                continue;
            }

            let timeout = if pnp {
                self.config.poll_timeout
            } else {
                self.config.relist_interval
            };

            if self.stop.load(Ordering::SeqCst) {
                break;
            }
            match self.context.get_status_change(timeout, &mut states) {
                Ok(()) | Err(pcsc::Error::Timeout) => {}
                Err(pcsc::Error::UnknownReader) => {
                    // List changed while in air, try again
                    relist = true;
                    continue;
                }
                Err(pcsc::Error::Cancelled) => {
                    debug!("Status change wait cancelled");
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "SCardGetStatusChange failed");
                    events.push(ReaderEvent::Error {
                        reader: None,
                        error: e,
                    });
                    break;
                }
            }

            if pnp {
                if let Some(entry) = states.pop() {
                    if entry.event_state().contains(State::CHANGED) {
                        debug!("PnP event");
                        pnp_state = entry.event_state() - State::CHANGED;
                        relist = true;
                    }
                }
            } else {
                relist = true;
            }

            let observed: Vec<Observation> = states
                .iter()
                .map(|state| Observation {
                    reader: state.name().to_string_lossy().into_owned(),
                    event_state: state.event_state(),
                    atr: state.atr().to_vec(),
                })
                .collect();
            if self.tracker.apply(&observed, &mut events) {
                relist = true;
            }
        }

        self.flush(&mut events);
        info!("Reader monitor stopped");
    }

    /// Check whether the platform supports the PnP pseudo reader
    fn probe_pnp(&self) -> bool {
        let mut probe = [ReaderState::new(PNP_NOTIFICATION(), State::UNAWARE)];
        match self.context.get_status_change(Duration::ZERO, &mut probe) {
            Err(pcsc::Error::Timeout) if probe[0].event_state().contains(State::UNKNOWN) => {
                info!("No PnP support, re-listing readers periodically");
                false
            }
            _ => true,
        }
    }

    fn list_readers(&self) -> Result<Vec<String>, pcsc::Error> {
        match self.context.list_readers_owned() {
            Ok(names) => Ok(names
                .iter()
                .map(|name| name.to_string_lossy().into_owned())
                .collect()),
            Err(pcsc::Error::NoReadersAvailable) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Post queued events; false when the receiver is gone
    fn flush(&self, events: &mut Vec<ReaderEvent>) -> bool {
        for event in events.drain(..) {
            if self.events.send(E::from(event)).is_err() {
                debug!("Reader event receiver gone");
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MonitorConfig::default();
        assert_eq!(config.poll_timeout, Duration::from_secs(600));
        assert!(config.relist_interval < config.poll_timeout);
    }
}
