//! Virtual COM port sink.
//!
//! Lets another program on the same machine read the NMEA stream as if
//! over a serial cable.  The sink delegates to a [`ComProvider`] chosen
//! once at construction:
//!
//! * [`PtyProvider`] — the paired-serial backend.  Allocates a
//!   pseudo-terminal, keeps the master side, and exposes the slave under
//!   the configured port name via a symlink.  Consumers open that path
//!   like any `/dev/tty*` device.
//! * [`FifoProvider`] — named-pipe fallback.  Creates a FIFO at the port
//!   name and silently drops frames until a reader connects; when the
//!   reader goes away it returns to waiting.
//!
//! All provider I/O is non-blocking: a full kernel buffer or an absent
//! client drops the frame rather than stalling the writer task.

use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{FromRawFd, IntoRawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info, warn};
use nix::fcntl::OFlag;
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, SetArg};
use nix::unistd::mkfifo;
use tokio::sync::mpsc;

use crate::endpoint::{ConnectionState, EndpointKind, StateCell, StateEvent};
use crate::error::{BridgeError, Result};

/// Backend behind the virtual COM sink: `open/close/write/is_ready`.
pub trait ComProvider: Send {
    fn open(&mut self) -> Result<()>;
    fn close(&mut self);
    /// Best-effort frame delivery; dropping is fine, blocking is not.
    fn write(&mut self, bytes: &[u8]) -> Result<()>;
    fn is_ready(&self) -> bool;
    /// Short backend label for logs.
    fn kind(&self) -> &'static str;
}

/// Pick the backend for `port`.  Auto mode prefers the pty pair when the
/// host can allocate one, otherwise (and in non-auto mode) the FIFO.
pub fn provider_for(port: &str, auto: bool) -> Box<dyn ComProvider> {
    if auto && posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).is_ok() {
        Box::new(PtyProvider::new(port))
    } else {
        Box::new(FifoProvider::new(port))
    }
}

// ── Pty backend ───────────────────────────────────────────────────────────────

pub struct PtyProvider {
    link:   PathBuf,
    master: Option<File>,
}

impl PtyProvider {
    pub fn new(link: impl Into<PathBuf>) -> Self {
        PtyProvider { link: link.into(), master: None }
    }
}

impl ComProvider for PtyProvider {
    fn open(&mut self) -> Result<()> {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK)?;
        grantpt(&master)?;
        unlockpt(&master)?;
        let slave = ptsname_r(&master)?;

        // Re-point the port name at the freshly allocated slave.
        if self.link.symlink_metadata().is_ok() {
            std::fs::remove_file(&self.link)?;
        }
        std::os::unix::fs::symlink(&slave, &self.link)?;
        info!("vcom: pty slave {slave} linked at {}", self.link.display());

        let master = unsafe { File::from_raw_fd(master.into_raw_fd()) };
        // Raw mode, or the line discipline would rewrite CR/LF in transit.
        let mut t = termios::tcgetattr(&master)?;
        termios::cfmakeraw(&mut t);
        termios::tcsetattr(&master, SetArg::TCSANOW, &t)?;

        self.master = Some(master);
        Ok(())
    }

    fn close(&mut self) {
        self.master = None;
        let _ = std::fs::remove_file(&self.link);
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let master = match self.master.as_mut() {
            Some(m) => m,
            None => {
                return Err(BridgeError::NotReady { name: self.link.display().to_string() })
            }
        };
        match master.write(bytes) {
            // A short write only loses part of one frame; the next frame
            // resynchronises the reader at the '$'.
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!("vcom: pty buffer full, frame dropped");
                Ok(())
            }
            // EIO: the client closed the slave side; it may reopen later.
            Err(e) if e.raw_os_error() == Some(libc::EIO) => {
                debug!("vcom: no pty client, frame dropped");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn is_ready(&self) -> bool {
        self.master.is_some()
    }

    fn kind(&self) -> &'static str {
        "pty"
    }
}

// ── FIFO backend ──────────────────────────────────────────────────────────────

pub struct FifoProvider {
    path:    PathBuf,
    created: bool,
    writer:  Option<File>,
}

impl FifoProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FifoProvider { path: path.into(), created: false, writer: None }
    }

    /// Try to attach the write end; `None` while no reader has the FIFO
    /// open.
    fn attach(&mut self) -> Result<Option<&mut File>> {
        if self.writer.is_none() {
            match std::fs::OpenOptions::new()
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(&self.path)
            {
                Ok(f) => {
                    info!("vcom: client connected on {}", self.path.display());
                    self.writer = Some(f);
                }
                Err(e) if e.raw_os_error() == Some(libc::ENXIO) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(self.writer.as_mut())
    }
}

impl ComProvider for FifoProvider {
    fn open(&mut self) -> Result<()> {
        match mkfifo(&self.path, Mode::from_bits_truncate(0o644)) {
            Ok(()) => {}
            Err(nix::errno::Errno::EEXIST) => {
                warn!("vcom: reusing existing FIFO at {}", self.path.display());
            }
            Err(e) => return Err(e.into()),
        }
        self.created = true;
        Ok(())
    }

    fn close(&mut self) {
        self.writer = None;
        if self.created {
            let _ = std::fs::remove_file(&self.path);
            self.created = false;
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let writer = match self.attach()? {
            Some(w) => w,
            // No reader yet: drop the frame, keep waiting.
            None => return Ok(()),
        };
        match writer.write(bytes) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                info!("vcom: client disconnected from {}", self.path.display());
                self.writer = None;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn is_ready(&self) -> bool {
        self.created
    }

    fn kind(&self) -> &'static str {
        "fifo"
    }
}

// ── Sink ──────────────────────────────────────────────────────────────────────

pub struct VirtualComSink {
    provider: Box<dyn ComProvider>,
    state:    Arc<StateCell>,
}

impl VirtualComSink {
    pub(crate) fn new(
        port:   String,
        auto:   bool,
        states: mpsc::UnboundedSender<StateEvent>,
    ) -> Self {
        let provider = provider_for(&port, auto);
        let name = format!("vcom:{port}");
        info!("{name}: using {} backend", provider.kind());
        VirtualComSink {
            provider,
            state: Arc::new(StateCell::new(name, EndpointKind::Sink, states)),
        }
    }

    pub fn name(&self) -> &str {
        self.state.name()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub(crate) fn state_cell(&self) -> Arc<StateCell> {
        Arc::clone(&self.state)
    }

    pub fn ready(&self) -> bool {
        self.state.get() == ConnectionState::Connected && self.provider.is_ready()
    }

    pub async fn start(&mut self) -> Result<()> {
        self.state.set(ConnectionState::Connecting);
        match self.provider.open() {
            Ok(()) => {
                self.state.set(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                self.state
                    .set_with(ConnectionState::Error, Some(e.to_string()));
                Err(e)
            }
        }
    }

    pub async fn stop(&mut self) {
        self.provider.close();
        self.state.set(ConnectionState::Disconnected);
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if !self.ready() {
            return Err(BridgeError::NotReady {
                name: self.state.name().to_string(),
            });
        }
        if let Err(e) = self.provider.write(bytes) {
            self.state
                .set_with(ConnectionState::Error, Some(e.to_string()));
            return Err(e);
        }
        Ok(())
    }
}
