//! The local terminal as a rendering surface, for the CLI.

use std::io::{Read, Write};
use std::sync::Arc;

use bytes::Bytes;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::portal::{Placement, Surface, SurfaceFactory};
use crate::session::SessionId;

#[derive(Error, Debug)]
pub enum TerminalError {
    #[error("failed to enable raw mode: {0}")]
    EnableRawMode(#[source] std::io::Error),
}

/// RAII guard for terminal raw mode.
///
/// When created, enables raw mode on the terminal. When dropped (even on panic),
/// restores the terminal to its previous state.
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn new() -> Result<Self, TerminalError> {
        enable_raw_mode().map_err(TerminalError::EnableRawMode)?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Current local terminal size as `(cols, rows)`.
pub fn terminal_size() -> std::io::Result<(u16, u16)> {
    size()
}

/// Forward chunks read from `reader` (normally stdin) until EOF or error.
///
/// The reader runs on a detached OS thread, not the blocking pool, so runtime
/// shutdown never waits on a read stuck at the terminal.
pub fn spawn_input_reader<R>(mut reader: R) -> std::io::Result<mpsc::Receiver<Bytes>>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel(64);
    std::thread::Builder::new()
        .name("kubeterm-input".into())
        .spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                            break;
                        }
                    }
                }
            }
        })?;
    Ok(rx)
}

/// Writes session output to stdout while visible.
///
/// Output that arrives while hidden is dropped here; it is still in the
/// session's scrollback.
pub struct StdoutSurface {
    visible: Mutex<bool>,
}

impl StdoutSurface {
    pub fn new() -> Self {
        Self {
            visible: Mutex::new(false),
        }
    }
}

impl Default for StdoutSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl Surface for StdoutSurface {
    fn write(&self, data: &[u8]) {
        if !*self.visible.lock() {
            return;
        }
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(data);
        let _ = stdout.flush();
    }

    fn reparent(&self, placement: &Placement) {
        *self.visible.lock() = matches!(placement, Placement::Visible(_));
    }

    fn fit(&self) -> Option<(u16, u16)> {
        terminal_size().ok()
    }

    fn focus(&self) {}

    fn clear(&self) {
        if *self.visible.lock() {
            let mut stdout = std::io::stdout().lock();
            let _ = crossterm::execute!(
                stdout,
                crossterm::terminal::Clear(crossterm::terminal::ClearType::All),
                crossterm::cursor::MoveTo(0, 0)
            );
        }
    }

    fn dispose(&self) {
        *self.visible.lock() = false;
    }
}

/// Hands out [`StdoutSurface`]s.
#[derive(Default)]
pub struct StdoutSurfaceFactory;

impl SurfaceFactory for StdoutSurfaceFactory {
    fn create(&self, session: &SessionId) -> Arc<dyn Surface> {
        tracing::debug!(session = %session, "creating stdout surface");
        Arc::new(StdoutSurface::new())
    }
}
