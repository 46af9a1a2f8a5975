//! NMEA byte-chunk sources.
//!
//! A source owns its connection state machine and a long-lived receive
//! task.  Received chunks are timestamped and handed to the session over
//! a bounded channel; connection transitions go out as [`StateEvent`]s.

mod tcp;
mod udp;

pub use tcp::TcpClientSource;
pub use udp::UdpSource;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::InputConfig;
use crate::endpoint::{ConnectionState, StateEvent};
use crate::error::Result;

/// One received chunk with its arrival time.
pub(crate) type DataChunk = (Vec<u8>, DateTime<Utc>);

/// Tagged source variant; the session only needs this operation set.
pub enum DataSource {
    Udp(UdpSource),
    Tcp(TcpClientSource),
}

impl DataSource {
    pub(crate) fn from_config(
        input:  &InputConfig,
        data:   mpsc::Sender<DataChunk>,
        states: mpsc::UnboundedSender<StateEvent>,
        cancel: CancellationToken,
    ) -> DataSource {
        match input {
            InputConfig::Udp { port, bind } => {
                DataSource::Udp(UdpSource::new(*port, *bind, data, states, cancel))
            }
            InputConfig::Tcp { host, port, reconnect_delay } => DataSource::Tcp(
                TcpClientSource::new(host.clone(), *port, *reconnect_delay, data, states, cancel),
            ),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            DataSource::Udp(s) => s.name(),
            DataSource::Tcp(s) => s.name(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        match self {
            DataSource::Udp(s) => s.state(),
            DataSource::Tcp(s) => s.state(),
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        match self {
            DataSource::Udp(s) => s.start().await,
            DataSource::Tcp(s) => s.start().await,
        }
    }

    /// Cancel the receive task and wait for it, bounded by the stop grace
    /// period.  No events are delivered once this returns.
    pub async fn stop(&mut self) {
        match self {
            DataSource::Udp(s) => s.stop().await,
            DataSource::Tcp(s) => s.stop().await,
        }
    }
}
