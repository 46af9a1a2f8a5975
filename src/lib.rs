//! GNSS data bridge.
//!
//! Ingests NMEA 0183 sentences from a network-attached GNSS receiver
//! (UDP listener or TCP client), validates framing and checksums, applies
//! type filtering and rate limiting, and fans every surviving sentence
//! out to any mix of sinks: physical serial port, virtual COM port, UDP
//! datagram and append-only file.  Frames are re-emitted byte-identical
//! to what the receiver sent, so downstream consumers cannot tell the
//! bridge was in the middle.
//!
//! The entry point is [`session::Session`]: feed it a
//! [`config::SessionConfig`], `start` it, and watch its event channel.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod filter;
pub mod health;
pub mod parser;
pub mod rate_limit;
pub mod sentence;
pub mod session;
pub mod sink;
pub mod source;
pub mod stats;

pub use config::{
    FilterConfig, FilterMode, InputConfig, OutputConfig, OutputKind, RateLimitConfig,
    SessionConfig,
};
pub use endpoint::{ConnectionState, EndpointKind, StateEvent};
pub use error::{BridgeError, Result};
pub use health::HealthStatus;
pub use sentence::NmeaSentence;
pub use session::{Session, SessionEvent, SessionState};
pub use stats::StatsSnapshot;
