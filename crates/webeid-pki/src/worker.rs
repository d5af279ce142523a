//! Credential worker thread
//!
//! The orchestrator and its token live on one dedicated thread. Other threads
//! post [`PkiCommand`]s through a [`PkiHandle`]; results come back as
//! [`PkiOutcome`]s on the owner's event channel.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info};
use webeid_common::{ContextId, Failure};

use crate::dialogs::Dialogs;
use crate::operation::{Operation, OperationOutput};
use crate::orchestrator::Orchestrator;
use crate::token::Token;

/// Commands accepted by the credential worker
#[derive(Debug)]
pub enum PkiCommand {
    /// A card was inserted into `reader`
    Refresh { reader: String, atr: Vec<u8> },
    /// The card in `reader` was removed
    Invalidate { reader: String },
    Execute(Operation),
    /// Stop the worker thread
    Stop,
}

/// Terminal result of one operation
#[derive(Debug, Clone, PartialEq)]
pub struct PkiOutcome {
    pub context: ContextId,
    pub id: String,
    pub result: Result<OperationOutput, Failure>,
}

/// Sending side of the worker's command queue
#[derive(Debug, Clone)]
pub struct PkiHandle {
    commands: Sender<PkiCommand>,
}

impl PkiHandle {
    pub fn new(commands: Sender<PkiCommand>) -> Self {
        Self { commands }
    }

    fn send(&self, command: PkiCommand) -> Result<(), Failure> {
        self.commands
            .send(command)
            .map_err(|_| Failure::technical("credential worker stopped"))
    }

    pub fn refresh(&self, reader: &str, atr: &[u8]) {
        let _ = self.send(PkiCommand::Refresh {
            reader: reader.to_string(),
            atr: atr.to_vec(),
        });
    }

    pub fn invalidate(&self, reader: &str) {
        let _ = self.send(PkiCommand::Invalidate {
            reader: reader.to_string(),
        });
    }

    /// Queue an operation; its outcome is posted to the event channel
    pub fn execute(&self, operation: Operation) -> Result<(), Failure> {
        self.send(PkiCommand::Execute(operation))
    }

    pub fn stop(&self) {
        let _ = self.send(PkiCommand::Stop);
    }
}

/// Background worker owning the orchestrator
pub struct PkiWorker<T, E> {
    orchestrator: Orchestrator<T>,
    command_rx: Receiver<PkiCommand>,
    event_tx: SyncSender<E>,
}

impl<T, E> PkiWorker<T, E>
where
    T: Token + 'static,
    E: From<PkiOutcome> + Send + 'static,
{
    /// Spawn a new credential worker thread
    pub fn spawn(
        token: T,
        dialogs: Arc<dyn Dialogs>,
        event_tx: SyncSender<E>,
    ) -> (PkiHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel();

        let handle = thread::spawn(move || {
            let worker = PkiWorker {
                orchestrator: Orchestrator::new(token, dialogs),
                command_rx,
                event_tx,
            };
            worker.run();
        });

        (PkiHandle::new(command_tx), handle)
    }

    fn run(mut self) {
        info!("Credential worker thread started");

        while let Ok(command) = self.command_rx.recv() {
            match command {
                PkiCommand::Refresh { reader, atr } => self.orchestrator.refresh(&reader, &atr),
                PkiCommand::Invalidate { reader } => self.orchestrator.invalidate(&reader),
                PkiCommand::Execute(operation) => {
                    let context = operation.context;
                    let id = operation.id.clone();

                    let orchestrator = &mut self.orchestrator;
                    let result = panic::catch_unwind(AssertUnwindSafe(|| orchestrator.execute(operation)))
                        .unwrap_or_else(|_| {
                            error!(context = %context, id = %id, "Operation panicked");
                            Err(Failure::technical("internal error"))
                        });

                    debug!(context = %context, id = %id, ok = result.is_ok(), "Operation finished");
                    if self.event_tx.send(E::from(PkiOutcome { context, id, result })).is_err() {
                        break;
                    }
                }
                PkiCommand::Stop => {
                    info!("Credential worker stopping");
                    break;
                }
            }
        }

        info!("Credential worker thread stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationRequest;
    use crate::testing::{fixture, FakeToken, ScriptedDialogs};
    use std::sync::mpsc::sync_channel;
    use webeid_common::CertificatePurpose;

    #[test]
    fn test_outcome_is_posted_with_context_and_id() {
        let (tx, rx) = sync_channel::<PkiOutcome>(4);
        let token = FakeToken::new(vec![fixture("sign")], 3);
        let (handle, join) = PkiWorker::spawn(token, Arc::new(ScriptedDialogs::default()), tx);

        let context = ContextId::new();
        handle
            .execute(Operation::new(
                context,
                "42",
                "https://example.com",
                OperationRequest::SelectCertificate {
                    purpose: CertificatePurpose::Signing,
                },
            ))
            .unwrap();

        let outcome = rx.recv().unwrap();
        assert_eq!(outcome.context, context);
        assert_eq!(outcome.id, "42");
        assert!(matches!(outcome.result, Ok(OperationOutput::Certificate(_))));

        handle.stop();
        join.join().unwrap();
    }

    #[test]
    fn test_stopped_worker_rejects_operations() {
        let (tx, _rx) = sync_channel::<PkiOutcome>(1);
        let token = FakeToken::new(Vec::new(), 3);
        let (handle, join) = PkiWorker::spawn(token, Arc::new(ScriptedDialogs::default()), tx);
        handle.stop();
        join.join().unwrap();

        let result = handle.execute(Operation::new(
            ContextId::new(),
            "1",
            "https://example.com",
            OperationRequest::Authenticate { nonce: "abc".into() },
        ));
        assert!(matches!(result, Err(Failure::TechnicalError { .. })));
    }
}
