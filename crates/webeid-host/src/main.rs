use std::io;
use std::process;
use std::sync::mpsc::sync_channel;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use webeid_card::ReaderMonitor;
use webeid_common::VERSION;
use webeid_pki::{Dialogs, HeadlessDialogs, Pkcs11Token, PkiWorker};

mod config;
mod context;
mod host;
mod origin;
mod protocol;
mod transport;
mod tui;

use config::{Args, DialogMode};
use host::{Host, HostEvent, NoReaders, ReaderDirectory};

/// Capacity of the host event queue
const EVENT_QUEUE: usize = 1024;

fn main() {
    // Stdout carries the native messaging pipe; logs go to stderr.
    // Set RUST_LOG=debug for detailed logs, default: info level
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    info!(
        version = VERSION,
        caller = ?args.caller,
        parent_window = ?args.parent_window,
        dialogs = args.dialogs.description(),
        "Starting"
    );

    if args.listen.is_none() && !transport::pipe::stdin_is_pipe() {
        println!("This is not a regular program, it is expected to be run from a browser.");
        process::exit(1);
    }

    let code = run(&args);
    info!(code, "Exiting");
    process::exit(code);
}

fn run(args: &Args) -> i32 {
    let (events, event_rx) = sync_channel::<HostEvent>(EVENT_QUEUE);

    let dialogs: Arc<dyn Dialogs> = match args.dialogs {
        DialogMode::Terminal => Arc::new(tui::TerminalDialogs::new()),
        DialogMode::Headless => Arc::new(HeadlessDialogs::from_env()),
    };

    let readers: Box<dyn ReaderDirectory> = match ReaderMonitor::spawn(args.monitor_config(), events.clone()) {
        Ok(monitor) => Box::new(monitor),
        Err(e) => {
            warn!(error = %e, "Reader monitor unavailable");
            Box::new(NoReaders)
        }
    };

    let token = Pkcs11Token::new(&args.pkcs11_module);
    let (pki, pki_thread) = PkiWorker::spawn(token, dialogs.clone(), events.clone());

    match &args.listen {
        Some(addr) => {
            if let Err(e) = transport::socket::listen(addr, events.clone()) {
                error!(addr = %addr, error = %e, "Cannot listen");
                pki.stop();
                return 1;
            }
        }
        None => {
            transport::pipe::spawn(events.clone());
        }
    }

    let mut host = Host::new(readers, pki.clone(), dialogs, events);
    let code = host.run(event_rx);

    host.shutdown();
    pki.stop();
    // A dialog may still be open on the worker; do not wait for it
    drop(pki_thread);
    code
}
