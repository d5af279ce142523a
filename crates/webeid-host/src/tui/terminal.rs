use std::fs::{File, OpenOptions};
use std::io;

use crossterm::{
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{backend::CrosstermBackend, Terminal};

#[cfg(windows)]
const TTY_PATH: &str = "CONOUT$";
#[cfg(not(windows))]
const TTY_PATH: &str = "/dev/tty";

/// The controlling terminal in raw mode on the alternate screen
///
/// Restored when dropped, also on early return.
pub struct Tty {
    terminal: Terminal<CrosstermBackend<File>>,
}

impl Tty {
    pub fn open() -> io::Result<Self> {
        let mut tty = OpenOptions::new().read(true).write(true).open(TTY_PATH)?;
        enable_raw_mode()?;
        if let Err(e) = execute!(tty, EnterAlternateScreen) {
            let _ = disable_raw_mode();
            return Err(e);
        }
        let terminal = Terminal::new(CrosstermBackend::new(tty))?;
        Ok(Self { terminal })
    }

    pub fn terminal(&mut self) -> &mut Terminal<CrosstermBackend<File>> {
        &mut self.terminal
    }
}

impl Drop for Tty {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(self.terminal.backend_mut(), LeaveAlternateScreen);
        let _ = self.terminal.show_cursor();
    }
}
