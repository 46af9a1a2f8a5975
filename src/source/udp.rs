//! UDP listener source.
//!
//! Binds a datagram socket and treats every nonzero-length datagram as
//! one receive event.  There is no peer to reconnect to, so the state
//! machine is bind-and-stay: a receive error is recorded as `error` but
//! the loop keeps listening.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::DataChunk;
use crate::endpoint::{join_with_grace, ConnectionState, EndpointKind, StateCell, StateEvent};
use crate::error::Result;

/// Plenty for any NMEA burst a receiver sends in one datagram.
const MAX_DATAGRAM: usize = 2048;
/// Breather after a receive error so a broken socket cannot spin.
const ERROR_BACKOFF: Duration = Duration::from_millis(200);

pub struct UdpSource {
    port:    u16,
    bind:    Option<IpAddr>,
    state:   Arc<StateCell>,
    data:    mpsc::Sender<DataChunk>,
    cancel:  CancellationToken,
    task:    Option<JoinHandle<()>>,
}

impl UdpSource {
    pub(crate) fn new(
        port:   u16,
        bind:   Option<IpAddr>,
        data:   mpsc::Sender<DataChunk>,
        states: mpsc::UnboundedSender<StateEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let name = format!("udp-in:{port}");
        UdpSource {
            port,
            bind,
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

    pub async fn start(&mut self) -> Result<()> {
        self.state.set(ConnectionState::Connecting);
        let addr = SocketAddr::new(
            self.bind.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            self.port,
        );
        let socket = match UdpSocket::bind(addr).await {
            Ok(s) => s,
            Err(e) => {
                self.state
                    .set_with(ConnectionState::Error, Some(format!("bind {addr}: {e}")));
                return Err(e.into());
            }
        };
        info!("{}: listening on {addr}", self.name());
        self.state.set(ConnectionState::Connected);

        let state = Arc::clone(&self.state);
        let data = self.data.clone();
        let cancel = self.cancel.clone();
        self.task = Some(tokio::spawn(async move {
            receive_loop(socket, state, data, cancel).await;
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

async fn receive_loop(
    socket: UdpSocket,
    state:  Arc<StateCell>,
    data:   mpsc::Sender<DataChunk>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            res = socket.recv_from(&mut buf) => match res {
                Ok((0, _)) => continue,
                Ok((n, peer)) => {
                    debug!("{}: {n} bytes from {peer}", state.name());
                    if data.send((buf[..n].to_vec(), Utc::now())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    state.set_with(ConnectionState::Error, Some(format!("receive: {e}")));
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }
    debug!("{}: receive loop ended", state.name());
}
