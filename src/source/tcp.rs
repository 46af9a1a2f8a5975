//! TCP client source with automatic reconnect.
//!
//! Connects to a host streaming NMEA lines and reads 4 KiB chunks.  Any
//! read failure or remote close drops the socket, parks in `reconnecting`
//! for the configured delay, and tries again until cancelled.
//! Cancellation is the normal shutdown path and never surfaces as an
//! error state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::DataChunk;
use crate::endpoint::{join_with_grace, ConnectionState, EndpointKind, StateCell, StateEvent};
use crate::error::Result;

const READ_BUF: usize = 4096;

pub struct TcpClientSource {
    host:            String,
    port:            u16,
    reconnect_delay: Duration,
    state:           Arc<StateCell>,
    data:            mpsc::Sender<DataChunk>,
    cancel:          CancellationToken,
    task:            Option<JoinHandle<()>>,
}

impl TcpClientSource {
    pub(crate) fn new(
        host:            String,
        port:            u16,
        reconnect_delay: Duration,
        data:            mpsc::Sender<DataChunk>,
        states:          mpsc::UnboundedSender<StateEvent>,
        cancel:          CancellationToken,
    ) -> Self {
        let name = format!("tcp-in:{host}:{port}");
        TcpClientSource {
            host,
            port,
            reconnect_delay,
            state: Arc::new(StateCell::new(name, EndpointKind::Source, states)),
            data,
            cancel,
            task: None,
        }
    }

    pub fn name(&self) -> &str {
        self.state.name()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// Spawn the reconnect loop.  Always succeeds; the first connection
    /// attempt happens on the spawned task.
    pub async fn start(&mut self) -> Result<()> {
        let host = self.host.clone();
        let port = self.port;
        let delay = self.reconnect_delay;
        let state = Arc::clone(&self.state);
        let data = self.data.clone();
        let cancel = self.cancel.clone();
        self.task = Some(tokio::spawn(async move {
            reconnect_loop(host, port, delay, state, data, cancel).await;
        }));
        Ok(())
    }

    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            join_with_grace(self.state.name(), task).await;
        }
        self.state.set(ConnectionState::Disconnected);
    }
}

async fn reconnect_loop(
    host:   String,
    port:   u16,
    delay:  Duration,
    state:  Arc<StateCell>,
    data:   mpsc::Sender<DataChunk>,
    cancel: CancellationToken,
) {
    loop {
        state.set(ConnectionState::Connecting);
        let connect = tokio::select! {
            _ = cancel.cancelled() => return,
            res = TcpStream::connect((host.as_str(), port)) => res,
        };

        match connect {
            Ok(mut stream) => {
                info!("{}: connected", state.name());
                state.set(ConnectionState::Connected);
                if !read_until_broken(&mut stream, &state, &data, &cancel).await {
                    return;
                }
                // Socket dropped here; fall through to the retry delay.
            }
            Err(e) => {
                state.set_with(ConnectionState::Reconnecting, Some(format!("connect: {e}")));
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Read chunks until the connection breaks.  Returns false when the loop
/// should end for good (cancel or session gone) rather than reconnect.
async fn read_until_broken(
    stream: &mut TcpStream,
    state:  &Arc<StateCell>,
    data:   &mpsc::Sender<DataChunk>,
    cancel: &CancellationToken,
) -> bool {
    let mut buf = [0u8; READ_BUF];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            res = stream.read(&mut buf) => match res {
                Ok(0) => {
                    state.set_with(
                        ConnectionState::Reconnecting,
                        Some("remote closed the connection".into()),
                    );
                    return true;
                }
                Ok(n) => {
                    debug!("{}: {n} bytes", state.name());
                    if data.send((buf[..n].to_vec(), Utc::now())).await.is_err() {
                        return false;
                    }
                }
                Err(e) => {
                    state.set_with(ConnectionState::Reconnecting, Some(format!("read: {e}")));
                    return true;
                }
            }
        }
    }
}
