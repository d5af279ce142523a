//! Command line configuration

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use webeid_card::MonitorConfig;

#[cfg(target_os = "macos")]
const DEFAULT_PKCS11_MODULE: &str = "/Library/OpenSC/lib/opensc-pkcs11.so";
#[cfg(windows)]
const DEFAULT_PKCS11_MODULE: &str = "opensc-pkcs11.dll";
#[cfg(not(any(target_os = "macos", windows)))]
const DEFAULT_PKCS11_MODULE: &str = "opensc-pkcs11.so";

/// How PIN entry and certificate selection reach the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DialogMode {
    /// Prompt on the controlling terminal
    Terminal,
    /// No user interaction; PIN from WEBEID_PIN
    Headless,
}

impl DialogMode {
    pub fn description(&self) -> &'static str {
        match self {
            DialogMode::Terminal => "terminal dialogs",
            DialogMode::Headless => "headless",
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "webeid-host")]
#[command(about = "Web eID host - browser access to smart cards and their certificates")]
#[command(version = webeid_common::VERSION)]
pub struct Args {
    /// Parent window handle passed by the browser
    #[arg(long)]
    pub parent_window: Option<String>,

    /// Serve newline-delimited JSON on this address instead of stdin/stdout
    #[arg(long, env = "WEBEID_LISTEN")]
    pub listen: Option<String>,

    /// PKCS#11 module used for certificates and signing
    #[arg(long, env = "WEBEID_PKCS11_MODULE", default_value = DEFAULT_PKCS11_MODULE)]
    pub pkcs11_module: PathBuf,

    /// Dialog implementation
    #[arg(long, value_enum, default_value_t = DialogMode::Terminal)]
    pub dialogs: DialogMode,

    /// Upper bound of one reader status wait, in seconds
    #[arg(long, default_value_t = 600)]
    pub poll_timeout: u64,

    /// Arguments added by the browser (caller origin, extension id)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub caller: Vec<String>,
}

impl Args {
    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            poll_timeout: Duration::from_secs(self.poll_timeout),
            ..MonitorConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_browser_invocation() {
        let args = Args::try_parse_from([
            "webeid-host",
            "--parent-window=42",
            "chrome-extension://abcdef/",
        ])
        .unwrap();
        assert_eq!(args.parent_window.as_deref(), Some("42"));
        assert_eq!(args.caller, vec!["chrome-extension://abcdef/"]);
        assert_eq!(args.dialogs, DialogMode::Terminal);
    }

    #[test]
    fn test_options() {
        let args = Args::try_parse_from([
            "webeid-host",
            "--listen",
            "127.0.0.1:24242",
            "--dialogs",
            "headless",
            "--poll-timeout",
            "5",
        ])
        .unwrap();
        assert_eq!(args.listen.as_deref(), Some("127.0.0.1:24242"));
        assert_eq!(args.dialogs, DialogMode::Headless);
        assert_eq!(args.monitor_config().poll_timeout, Duration::from_secs(5));
        assert_eq!(args.monitor_config().relist_interval, Duration::from_secs(2));
    }
}
