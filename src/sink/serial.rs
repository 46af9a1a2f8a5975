//! Physical serial port sink.

use std::sync::Arc;

use log::info;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};

use crate::endpoint::{ConnectionState, EndpointKind, StateCell, StateEvent};
use crate::error::{BridgeError, Result};

pub struct SerialSink {
    port:      String,
    baud:      u32,
    data_bits: DataBits,
    parity:    Parity,
    stop_bits: StopBits,
    state:     Arc<StateCell>,
    stream:    Option<SerialStream>,
}

impl SerialSink {
    pub(crate) fn new(
        port:      String,
        baud:      u32,
        data_bits: DataBits,
        parity:    Parity,
        stop_bits: StopBits,
        states:    mpsc::UnboundedSender<StateEvent>,
    ) -> Self {
        let name = format!("serial:{port}");
        SerialSink {
            port,
            baud,
            data_bits,
            parity,
            stop_bits,
            state: Arc::new(StateCell::new(name, EndpointKind::Sink, states)),
            stream: None,
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
        self.state.get() == ConnectionState::Connected && self.stream.is_some()
    }

    pub async fn start(&mut self) -> Result<()> {
        self.state.set(ConnectionState::Connecting);
        let stream = tokio_serial::new(self.port.as_str(), self.baud)
            .data_bits(self.data_bits)
            .parity(self.parity)
            .stop_bits(self.stop_bits)
            .open_native_async();
        match stream {
            Ok(s) => {
                info!("{}: open at {} baud", self.name(), self.baud);
                self.stream = Some(s);
                self.state.set(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                self.state
                    .set_with(ConnectionState::Error, Some(e.to_string()));
                Err(e.into())
            }
        }
    }

    pub async fn stop(&mut self) {
        if let Some(mut s) = self.stream.take() {
            let _ = s.flush().await;
        }
        self.state.set(ConnectionState::Disconnected);
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or_else(|| BridgeError::NotReady {
            name: self.state.name().to_string(),
        })?;
        let res = async {
            stream.write_all(bytes).await?;
            stream.flush().await
        }
        .await;
        if let Err(e) = res {
            self.state
                .set_with(ConnectionState::Error, Some(e.to_string()));
            self.stream = None;
            return Err(e.into());
        }
        Ok(())
    }
}
