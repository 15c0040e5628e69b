//! Keyboard handling: raw mode and the quit-key watcher.

use std::io::{self, IsTerminal};
use std::thread;
use std::time::Duration;

use aoa_core::ShutdownSignal;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Raw mode for the lifetime of the guard.
pub struct RawModeGuard;

impl RawModeGuard {
    /// Enable raw mode when stdin is a terminal.
    pub fn enable() -> Option<Self> {
        if !io::stdin().is_terminal() {
            return None;
        }
        match terminal::enable_raw_mode() {
            Ok(()) => Some(Self),
            Err(e) => {
                debug!(error = %e, "Raw mode unavailable");
                None
            }
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// `q`, `Q`, `Esc` or Ctrl+C.
pub fn is_quit_key(key: &KeyEvent) -> bool {
    if key.kind != KeyEventKind::Press {
        return false;
    }
    match key.code {
        KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => true,
        KeyCode::Char('c') => key.modifiers.contains(KeyModifiers::CONTROL),
        _ => false,
    }
}

/// Watch the keyboard in a background thread and trigger `signal` on a quit
/// key. The thread also ends once `signal` is triggered elsewhere.
pub fn spawn_watcher(signal: ShutdownSignal) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        while !signal.is_triggered() {
            if !event::poll(POLL_INTERVAL).unwrap_or(false) {
                continue;
            }
            match event::read() {
                Ok(Event::Key(key)) if is_quit_key(&key) => {
                    info!("Quit requested");
                    signal.trigger();
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "Keyboard watcher stopped");
                    break;
                }
            }
        }
    })
}
