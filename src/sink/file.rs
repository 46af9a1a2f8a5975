//! Append-only NMEA log file sink.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use log::info;
use tokio::fs::{create_dir_all, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::endpoint::{ConnectionState, EndpointKind, StateCell, StateEvent};
use crate::error::{BridgeError, Result};

pub struct FileSink {
    path:           PathBuf,
    timestamp_name: bool,
    state:          Arc<StateCell>,
    file:           Option<tokio::fs::File>,
}

impl FileSink {
    pub(crate) fn new(
        path:           PathBuf,
        timestamp_name: bool,
        states:         mpsc::UnboundedSender<StateEvent>,
    ) -> Self {
        let name = format!("file:{}", path.display());
        FileSink {
            path,
            timestamp_name,
            state: Arc::new(StateCell::new(name, EndpointKind::Sink, states)),
            file: None,
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
        self.state.get() == ConnectionState::Connected && self.file.is_some()
    }

    pub async fn start(&mut self) -> Result<()> {
        self.state.set(ConnectionState::Connecting);
        match self.open().await {
            Ok(file) => {
                self.file = Some(file);
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

    async fn open(&self) -> Result<tokio::fs::File> {
        let path = if self.timestamp_name {
            let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
            stamped_path(&self.path, &stamp)
        } else {
            self.path.clone()
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        info!("{}: appending to {}", self.name(), path.display());
        Ok(file)
    }

    pub async fn stop(&mut self) {
        if let Some(mut f) = self.file.take() {
            let _ = f.flush().await;
        }
        self.state.set(ConnectionState::Disconnected);
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let file = self.file.as_mut().ok_or_else(|| BridgeError::NotReady {
            name: self.state.name().to_string(),
        })?;
        let res = async {
            file.write_all(bytes).await?;
            file.flush().await
        }
        .await;
        if let Err(e) = res {
            self.state
                .set_with(ConnectionState::Error, Some(e.to_string()));
            self.file = None;
            return Err(e.into());
        }
        Ok(())
    }
}

/// `logs/nmea.log` + `20240131_120000` → `logs/nmea_20240131_120000.log`.
fn stamped_path(path: &Path, stamp: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}_{stamp}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{stamp}"),
    };
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_lands_before_extension() {
        assert_eq!(
            stamped_path(Path::new("/var/log/nmea.log"), "20240131_120000"),
            PathBuf::from("/var/log/nmea_20240131_120000.log")
        );
        assert_eq!(
            stamped_path(Path::new("capture"), "20240131_120000"),
            PathBuf::from("capture_20240131_120000")
        );
    }
}
