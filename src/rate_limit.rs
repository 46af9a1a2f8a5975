//! Output rate limiting.
//!
//! Gates sentences on a minimum interval derived from a maximum rate in
//! Hz, either globally or per sentence type.  Not on the hot path in any
//! meaningful sense (NMEA runs at a few dozen Hz at most), so a plain
//! mutex guards the emit bookkeeping.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;
use crate::sentence::NmeaSentence;

#[derive(Debug, Default)]
struct EmitTimes {
    global:   Option<Instant>,
    per_type: HashMap<String, Instant>,
}

#[derive(Debug)]
pub struct RateLimiter {
    /// `None` when the configured rate is zero or negative (disabled).
    interval: Option<Duration>,
    per_type: bool,
    times:    Mutex<EmitTimes>,
}

impl RateLimiter {
    pub fn new(cfg: &RateLimitConfig) -> Self {
        let interval = if cfg.max_hz > 0.0 {
            Some(Duration::from_secs_f64(1.0 / cfg.max_hz))
        } else {
            None
        };
        RateLimiter {
            interval,
            per_type: cfg.per_type,
            times: Mutex::new(EmitTimes::default()),
        }
    }

    /// Unlimited pass-through.
    pub fn unlimited() -> Self {
        RateLimiter::new(&RateLimitConfig { max_hz: 0.0, per_type: false })
    }

    /// Whether `sentence` may be emitted now; records the emit if so.
    pub fn should_emit(&self, sentence: &NmeaSentence) -> bool {
        self.should_emit_at(sentence, Instant::now())
    }

    fn should_emit_at(&self, sentence: &NmeaSentence, now: Instant) -> bool {
        let interval = match self.interval {
            Some(i) => i,
            None => return true,
        };
        let mut times = self.times.lock().unwrap();
        if self.per_type {
            let last = times.per_type.get(&sentence.full_type()).copied();
            if last.is_some_and(|t| now.duration_since(t) < interval) {
                return false;
            }
            times.per_type.insert(sentence.full_type(), now);
        } else {
            if times.global.is_some_and(|t| now.duration_since(t) < interval) {
                return false;
            }
            times.global = Some(now);
        }
        true
    }

    /// Forget all emit history.
    pub fn reset(&self) {
        let mut times = self.times.lock().unwrap();
        times.global = None;
        times.per_type.clear();
    }
}
