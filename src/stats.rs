//! Session statistics.
//!
//! Counters are plain atomics: the pipeline task increments them while a
//! status observer reads snapshots, so no counter read ever blocks the
//! data path.  Timestamps sit behind a mutex taken only on session start
//! and chunk arrival.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

#[derive(Debug, Default)]
struct Times {
    session_start: Option<DateTime<Utc>>,
    last_data:     Option<DateTime<Utc>>,
}

/// Shared monotonic counters for one session.
#[derive(Debug, Default)]
pub struct SessionStats {
    sentences_received: AtomicU64,
    sentences_sent:     AtomicU64,
    bytes_received:     AtomicU64,
    bytes_sent:         AtomicU64,
    parse_errors:       AtomicU64,
    checksum_errors:    AtomicU64,
    write_errors:       AtomicU64,
    /// Current data rate, stored as `f64` bits.
    rate_bits:          AtomicU64,
    times:              Mutex<Times>,
}

/// Point-in-time copy of all statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub sentences_received: u64,
    pub sentences_sent:     u64,
    pub bytes_received:     u64,
    pub bytes_sent:         u64,
    pub parse_errors:       u64,
    pub checksum_errors:    u64,
    pub write_errors:       u64,
    pub current_rate_hz:    f64,
    pub session_start:      Option<DateTime<Utc>>,
    pub last_data:          Option<DateTime<Utc>>,
}

impl StatsSnapshot {
    /// Time since session start, if the session ever started.
    pub fn session_duration(&self) -> Option<Duration> {
        let start = self.session_start?;
        (Utc::now() - start).to_std().ok()
    }
}

impl SessionStats {
    pub fn new() -> Self {
        SessionStats::default()
    }

    /// Zero everything and stamp a new session start.
    pub fn reset(&self, session_start: DateTime<Utc>) {
        self.sentences_received.store(0, Ordering::Relaxed);
        self.sentences_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.parse_errors.store(0, Ordering::Relaxed);
        self.checksum_errors.store(0, Ordering::Relaxed);
        self.write_errors.store(0, Ordering::Relaxed);
        self.rate_bits.store(0f64.to_bits(), Ordering::Relaxed);
        let mut times = self.times.lock().unwrap();
        times.session_start = Some(session_start);
        times.last_data = None;
    }

    pub fn add_sentences_received(&self, n: u64) {
        self.sentences_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_sentences_sent(&self, n: u64) {
        self.sentences_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_parse_errors(&self, n: u64) {
        self.parse_errors.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr_checksum_errors(&self) {
        self.checksum_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_write_errors(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_current_rate(&self, hz: f64) {
        self.rate_bits.store(hz.to_bits(), Ordering::Relaxed);
    }

    pub fn mark_data_received(&self, at: DateTime<Utc>) {
        self.times.lock().unwrap().last_data = Some(at);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let times = self.times.lock().unwrap();
        StatsSnapshot {
            sentences_received: self.sentences_received.load(Ordering::Relaxed),
            sentences_sent:     self.sentences_sent.load(Ordering::Relaxed),
            bytes_received:     self.bytes_received.load(Ordering::Relaxed),
            bytes_sent:         self.bytes_sent.load(Ordering::Relaxed),
            parse_errors:       self.parse_errors.load(Ordering::Relaxed),
            checksum_errors:    self.checksum_errors.load(Ordering::Relaxed),
            write_errors:       self.write_errors.load(Ordering::Relaxed),
            current_rate_hz:    f64::from_bits(self.rate_bits.load(Ordering::Relaxed)),
            session_start:      times.session_start,
            last_data:          times.last_data,
        }
    }
}
