//! Session configuration.
//!
//! The session core takes a [`SessionConfig`] as a structured value at
//! start time and treats it as immutable for the session's lifetime.  The
//! daemon binary builds one from a flat `key = value` file in
//! `gnss_bridge.conf` via [`load_config`].

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio_serial::{DataBits, Parity, StopBits};

use crate::error::{BridgeError, Result};

// Defaults for the flat config file.
const UDP_PORT:       u16 = 10110;
const TCP_PORT:       u16 = 10110;
const RECONNECT_SECS: u64 = 5;
const SERIAL_BAUD:    u32 = 115_200;

/// Where the sentences come from.
#[derive(Debug, Clone, PartialEq)]
pub enum InputConfig {
    /// Listen for NMEA datagrams, e.g. from a Wi-Fi GNSS receiver.
    Udp {
        port: u16,
        bind: Option<IpAddr>,
    },
    /// Connect to a TCP endpoint streaming NMEA lines.
    Tcp {
        host:            String,
        port:            u16,
        reconnect_delay: Duration,
    },
}

/// One configured output with its enable switch.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputConfig {
    pub enabled: bool,
    pub kind:    OutputKind,
}

impl OutputConfig {
    pub fn enabled(kind: OutputKind) -> Self {
        OutputConfig { enabled: true, kind }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputKind {
    /// Physical serial port.
    Serial {
        port:      String,
        baud:      u32,
        data_bits: DataBits,
        parity:    Parity,
        stop_bits: StopBits,
    },
    /// Paired virtual COM port (pty pair, or named-pipe fallback).
    VirtualCom {
        port: String,
        auto: bool,
    },
    /// One UDP datagram per sentence to a fixed destination.
    Udp {
        host:      String,
        port:      u16,
        broadcast: bool,
    },
    /// Append-only NMEA log file.
    File {
        path:           PathBuf,
        timestamp_name: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMode {
    #[default]
    AllowAll,
    AllowList,
    BlockList,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FilterConfig {
    pub mode:  FilterMode,
    pub allow: Vec<String>,
    pub block: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Maximum output rate in Hz; zero or negative disables the limiter.
    pub max_hz:   f64,
    /// Gate each sentence type independently instead of the whole stream.
    pub per_type: bool,
}

/// Everything the session needs, fixed for the session's duration.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub input:      InputConfig,
    pub outputs:    Vec<OutputConfig>,
    pub filter:     Option<FilterConfig>,
    pub rate_limit: Option<RateLimitConfig>,
}

impl SessionConfig {
    /// Reject configurations the session could not start with.
    pub fn validate(&self) -> Result<()> {
        match &self.input {
            InputConfig::Udp { port, .. } => {
                if *port == 0 {
                    return Err(BridgeError::Config("UDP input port must be nonzero".into()));
                }
            }
            InputConfig::Tcp { host, port, .. } => {
                if host.is_empty() {
                    return Err(BridgeError::Config("TCP input host is required".into()));
                }
                if *port == 0 {
                    return Err(BridgeError::Config("TCP input port must be nonzero".into()));
                }
            }
        }

        if !self.outputs.iter().any(|o| o.enabled) {
            return Err(BridgeError::Config("at least one enabled output is required".into()));
        }

        for output in self.outputs.iter().filter(|o| o.enabled) {
            match &output.kind {
                OutputKind::Serial { port, baud, .. } => {
                    if port.is_empty() {
                        return Err(BridgeError::Config("serial output port name is required".into()));
                    }
                    if *baud == 0 {
                        return Err(BridgeError::Config("serial baud rate must be nonzero".into()));
                    }
                }
                OutputKind::VirtualCom { port, .. } => {
                    if port.is_empty() {
                        return Err(BridgeError::Config("virtual COM port name is required".into()));
                    }
                }
                OutputKind::Udp { host, port, .. } => {
                    if host.is_empty() {
                        return Err(BridgeError::Config("UDP output host is required".into()));
                    }
                    if *port == 0 {
                        return Err(BridgeError::Config("UDP output port must be nonzero".into()));
                    }
                }
                OutputKind::File { path, .. } => {
                    if path.as_os_str().is_empty() {
                        return Err(BridgeError::Config("file output path is required".into()));
                    }
                }
            }
        }

        Ok(())
    }
}

// ── Flat config file (daemon binary) ──────────────────────────────────────────

/// Configuration parsed from `gnss_bridge.conf`.
#[derive(Debug, Clone)]
pub struct FileConfig {
    pub session:    SessionConfig,
    pub log_syslog: bool,
}

/// Accumulates the flat keys before assembly into a [`SessionConfig`].
#[derive(Debug)]
struct RawConfig {
    input:              String,
    udp_port:           u16,
    udp_bind:           Option<IpAddr>,
    tcp_host:           String,
    tcp_port:           u16,
    tcp_reconnect_secs: u64,
    serial_out:         Option<String>,
    serial_baud:        u32,
    serial_data_bits:   DataBits,
    serial_parity:      Parity,
    serial_stop_bits:   StopBits,
    vcom_out:           Option<String>,
    vcom_auto:          bool,
    udp_out_host:       Option<String>,
    udp_out_port:       u16,
    udp_out_broadcast:  bool,
    file_out:           Option<PathBuf>,
    file_timestamp:     bool,
    filter_mode:        FilterMode,
    filter_allow:       Vec<String>,
    filter_block:       Vec<String>,
    max_rate_hz:        f64,
    rate_per_type:      bool,
    log_syslog:         bool,
}

impl Default for RawConfig {
    fn default() -> Self {
        RawConfig {
            input:              "udp".into(),
            udp_port:           UDP_PORT,
            udp_bind:           None,
            tcp_host:           String::new(),
            tcp_port:           TCP_PORT,
            tcp_reconnect_secs: RECONNECT_SECS,
            serial_out:         None,
            serial_baud:        SERIAL_BAUD,
            serial_data_bits:   DataBits::Eight,
            serial_parity:      Parity::None,
            serial_stop_bits:   StopBits::One,
            vcom_out:           None,
            vcom_auto:          true,
            udp_out_host:       None,
            udp_out_port:       0,
            udp_out_broadcast:  false,
            file_out:           None,
            file_timestamp:     false,
            filter_mode:        FilterMode::AllowAll,
            filter_allow:       Vec::new(),
            filter_block:       Vec::new(),
            max_rate_hz:        0.0,
            rate_per_type:      false,
            log_syslog:         true,
        }
    }
}

/// Parse `path` as a `gnss_bridge.conf` key=value configuration file.
pub fn load_config(path: &Path) -> Result<FileConfig> {
    let content = fs::read_to_string(path)
        .map_err(|e| BridgeError::Config(format!("cannot read {}: {e}", path.display())))?;
    parse_config(&content)
}

fn parse_config(content: &str) -> Result<FileConfig> {
    let mut raw = RawConfig::default();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.splitn(2, '=');
        let key = match parts.next() {
            Some(k) => k.trim().to_ascii_lowercase(),
            None => continue,
        };
        let val = match parts.next() {
            Some(v) => v.trim().to_string(),
            None => continue,
        };
        if val.is_empty() {
            continue;
        }

        match key.as_str() {
            "input"              => raw.input              = val.to_ascii_lowercase(),
            "udp_port"           => raw.udp_port           = val.parse().unwrap_or(UDP_PORT),
            "udp_bind"           => raw.udp_bind           = val.parse().ok(),
            "tcp_host"           => raw.tcp_host           = val,
            "tcp_port"           => raw.tcp_port           = val.parse().unwrap_or(TCP_PORT),
            "tcp_reconnect_secs" => raw.tcp_reconnect_secs = val.parse().unwrap_or(RECONNECT_SECS),
            "serial_out"         => raw.serial_out         = Some(val),
            "serial_baud"        => raw.serial_baud        = val.parse().unwrap_or(SERIAL_BAUD),
            "serial_data_bits"   => raw.serial_data_bits   = parse_data_bits(&val),
            "serial_parity"      => raw.serial_parity      = parse_parity(&val),
            "serial_stop_bits"   => raw.serial_stop_bits   = parse_stop_bits(&val),
            "vcom_out"           => raw.vcom_out           = Some(val),
            "vcom_auto"          => raw.vcom_auto          = parse_bool(&val),
            "udp_out_host"       => raw.udp_out_host       = Some(val),
            "udp_out_port"       => raw.udp_out_port       = val.parse().unwrap_or(0),
            "udp_out_broadcast"  => raw.udp_out_broadcast  = parse_bool(&val),
            "file_out"           => raw.file_out           = Some(PathBuf::from(&val)),
            "file_timestamp"     => raw.file_timestamp     = parse_bool(&val),
            "filter_mode"        => raw.filter_mode        = parse_filter_mode(&val),
            "filter_allow"       => raw.filter_allow       = parse_list(&val),
            "filter_block"       => raw.filter_block       = parse_list(&val),
            "max_rate_hz"        => raw.max_rate_hz        = val.parse().unwrap_or(0.0),
            "rate_per_type"      => raw.rate_per_type      = parse_bool(&val),
            "log_syslog"         => raw.log_syslog         = parse_bool(&val),
            _ => {} // ignore unknown keys
        }
    }

    let input = match raw.input.as_str() {
        "tcp" => InputConfig::Tcp {
            host:            raw.tcp_host,
            port:            raw.tcp_port,
            reconnect_delay: Duration::from_secs(raw.tcp_reconnect_secs),
        },
        _ => InputConfig::Udp { port: raw.udp_port, bind: raw.udp_bind },
    };

    let mut outputs = Vec::new();
    if let Some(port) = raw.serial_out {
        outputs.push(OutputConfig::enabled(OutputKind::Serial {
            port,
            baud:      raw.serial_baud,
            data_bits: raw.serial_data_bits,
            parity:    raw.serial_parity,
            stop_bits: raw.serial_stop_bits,
        }));
    }
    if let Some(port) = raw.vcom_out {
        outputs.push(OutputConfig::enabled(OutputKind::VirtualCom {
            port,
            auto: raw.vcom_auto,
        }));
    }
    if let Some(host) = raw.udp_out_host {
        outputs.push(OutputConfig::enabled(OutputKind::Udp {
            host,
            port:      raw.udp_out_port,
            broadcast: raw.udp_out_broadcast,
        }));
    }
    if let Some(path) = raw.file_out {
        outputs.push(OutputConfig::enabled(OutputKind::File {
            path,
            timestamp_name: raw.file_timestamp,
        }));
    }

    let filter = match raw.filter_mode {
        FilterMode::AllowAll => None,
        mode => Some(FilterConfig {
            mode,
            allow: raw.filter_allow,
            block: raw.filter_block,
        }),
    };
    let rate_limit = (raw.max_rate_hz > 0.0).then_some(RateLimitConfig {
        max_hz:   raw.max_rate_hz,
        per_type: raw.rate_per_type,
    });

    Ok(FileConfig {
        session: SessionConfig { input, outputs, filter, rate_limit },
        log_syslog: raw.log_syslog,
    })
}

fn parse_bool(val: &str) -> bool {
    val == "true" || val == "1" || val == "yes"
}

fn parse_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_filter_mode(val: &str) -> FilterMode {
    match val.to_ascii_lowercase().as_str() {
        "allow" | "allowlist"  => FilterMode::AllowList,
        "block" | "blocklist"  => FilterMode::BlockList,
        _                      => FilterMode::AllowAll,
    }
}

fn parse_data_bits(val: &str) -> DataBits {
    match val {
        "5" => DataBits::Five,
        "6" => DataBits::Six,
        "7" => DataBits::Seven,
        _   => DataBits::Eight,
    }
}

fn parse_parity(val: &str) -> Parity {
    match val.to_ascii_lowercase().as_str() {
        "even" => Parity::Even,
        "odd"  => Parity::Odd,
        _      => Parity::None,
    }
}

fn parse_stop_bits(val: &str) -> StopBits {
    match val {
        "2" => StopBits::Two,
        _   => StopBits::One,
    }
}
