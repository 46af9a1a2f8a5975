//! NMEA frame sinks.
//!
//! A sink owns its connection state machine and writes complete frames.
//! Every variant flushes per write: sentences are tiny and the consumers
//! on the far side are latency-sensitive navigation programs.  A failed
//! sink parks in `error` and stays there; the session keeps broadcasting
//! to the others.

mod file;
mod serial;
mod udp;
pub mod vcom;

pub use file::FileSink;
pub use serial::SerialSink;
pub use udp::UdpSink;
pub use vcom::VirtualComSink;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::OutputKind;
use crate::endpoint::{ConnectionState, StateCell, StateEvent};
use crate::error::Result;

/// Tagged sink variant; the session only needs this operation set.
pub enum DataSink {
    Serial(SerialSink),
    VirtualCom(VirtualComSink),
    Udp(UdpSink),
    File(FileSink),
}

impl DataSink {
    pub(crate) fn from_config(
        kind:   &OutputKind,
        states: mpsc::UnboundedSender<StateEvent>,
    ) -> DataSink {
        match kind {
            OutputKind::Serial { port, baud, data_bits, parity, stop_bits } => {
                DataSink::Serial(SerialSink::new(
                    port.clone(),
                    *baud,
                    *data_bits,
                    *parity,
                    *stop_bits,
                    states,
                ))
            }
            OutputKind::VirtualCom { port, auto } => {
                DataSink::VirtualCom(VirtualComSink::new(port.clone(), *auto, states))
            }
            OutputKind::Udp { host, port, broadcast } => {
                DataSink::Udp(UdpSink::new(host.clone(), *port, *broadcast, states))
            }
            OutputKind::File { path, timestamp_name } => {
                DataSink::File(FileSink::new(path.clone(), *timestamp_name, states))
            }
        }
    }

    pub fn name(&self) -> &str {
        match self {
            DataSink::Serial(s) => s.name(),
            DataSink::VirtualCom(s) => s.name(),
            DataSink::Udp(s) => s.name(),
            DataSink::File(s) => s.name(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        match self {
            DataSink::Serial(s) => s.state(),
            DataSink::VirtualCom(s) => s.state(),
            DataSink::Udp(s) => s.state(),
            DataSink::File(s) => s.state(),
        }
    }

    /// Shared handle onto this sink's state cell, for broadcast gating.
    pub(crate) fn state_cell(&self) -> Arc<StateCell> {
        match self {
            DataSink::Serial(s) => s.state_cell(),
            DataSink::VirtualCom(s) => s.state_cell(),
            DataSink::Udp(s) => s.state_cell(),
            DataSink::File(s) => s.state_cell(),
        }
    }

    /// Whether a write may be attempted without a definite lifecycle
    /// failure.
    pub fn ready(&self) -> bool {
        match self {
            DataSink::Serial(s) => s.ready(),
            DataSink::VirtualCom(s) => s.ready(),
            DataSink::Udp(s) => s.ready(),
            DataSink::File(s) => s.ready(),
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        match self {
            DataSink::Serial(s) => s.start().await,
            DataSink::VirtualCom(s) => s.start().await,
            DataSink::Udp(s) => s.start().await,
            DataSink::File(s) => s.start().await,
        }
    }

    pub async fn stop(&mut self) {
        match self {
            DataSink::Serial(s) => s.stop().await,
            DataSink::VirtualCom(s) => s.stop().await,
            DataSink::Udp(s) => s.stop().await,
            DataSink::File(s) => s.stop().await,
        }
    }

    /// Write one frame, flushing.  Fails with `NotReady` before `start`
    /// or after a fault; transport failures move the sink to `error` and
    /// surface the cause.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        match self {
            DataSink::Serial(s) => s.write(bytes).await,
            DataSink::VirtualCom(s) => s.write(bytes).await,
            DataSink::Udp(s) => s.write(bytes).await,
            DataSink::File(s) => s.write(bytes).await,
        }
    }
}
