//! UDP datagram sink.
//!
//! Resolves the destination once at start (literal address, else first
//! DNS result, IPv4 preferred) and sends one datagram per frame, with
//! SO_BROADCAST optionally enabled for subnet-wide feeds.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use log::info;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc;

use crate::endpoint::{ConnectionState, EndpointKind, StateCell, StateEvent};
use crate::error::{BridgeError, Result};

pub struct UdpSink {
    host:      String,
    port:      u16,
    broadcast: bool,
    state:     Arc<StateCell>,
    socket:    Option<(UdpSocket, SocketAddr)>,
}

impl UdpSink {
    pub(crate) fn new(
        host:      String,
        port:      u16,
        broadcast: bool,
        states:    mpsc::UnboundedSender<StateEvent>,
    ) -> Self {
        let name = format!("udp-out:{host}:{port}");
        UdpSink {
            host,
            port,
            broadcast,
            state: Arc::new(StateCell::new(name, EndpointKind::Sink, states)),
            socket: None,
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
        self.state.get() == ConnectionState::Connected && self.socket.is_some()
    }

    pub async fn start(&mut self) -> Result<()> {
        self.state.set(ConnectionState::Connecting);
        match self.open().await {
            Ok(pair) => {
                info!("{}: sending to {}", self.name(), pair.1);
                self.socket = Some(pair);
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

    async fn open(&self) -> Result<(UdpSocket, SocketAddr)> {
        let dest = self.resolve().await?;
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        if self.broadcast {
            socket.set_broadcast(true)?;
        }
        Ok((socket, dest))
    }

    async fn resolve(&self) -> Result<SocketAddr> {
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }
        let addrs: Vec<SocketAddr> = lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| BridgeError::Config(format!("cannot resolve {}: {e}", self.host)))?
            .collect();
        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| BridgeError::Config(format!("no addresses for {}", self.host)))
    }

    pub async fn stop(&mut self) {
        self.socket = None;
        self.state.set(ConnectionState::Disconnected);
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let (socket, dest) = self.socket.as_ref().ok_or_else(|| BridgeError::NotReady {
            name: self.state.name().to_string(),
        })?;
        if let Err(e) = socket.send_to(bytes, *dest).await {
            self.state
                .set_with(ConnectionState::Error, Some(e.to_string()));
            self.socket = None;
            return Err(e.into());
        }
        Ok(())
    }
}
