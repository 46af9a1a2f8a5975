//! Parsed NMEA 0183 sentence.
//!
//! A sentence keeps the exact byte image it was received with (from `$`
//! through the `*HH` checksum, CR/LF stripped) so that re-emitted frames
//! are byte-identical to what the receiver transmitted.  Sentences are
//! only ever built by the parser.

use chrono::{DateTime, Utc};

/// One NMEA sentence as it came off the wire.
#[derive(Debug, Clone)]
pub struct NmeaSentence {
    talker:        String,
    sentence_type: String,
    fields:        Vec<String>,
    checksum:      u8,
    raw:           Vec<u8>,
    received_at:   DateTime<Utc>,
    valid:         bool,
}

impl NmeaSentence {
    pub(crate) fn new(
        talker:        String,
        sentence_type: String,
        fields:        Vec<String>,
        checksum:      u8,
        raw:           Vec<u8>,
        received_at:   DateTime<Utc>,
        valid:         bool,
    ) -> Self {
        NmeaSentence { talker, sentence_type, fields, checksum, raw, received_at, valid }
    }

    /// Two-character talker identifier (e.g. `GN`, `GP`).
    pub fn talker(&self) -> &str {
        &self.talker
    }

    /// Sentence type code (e.g. `GGA`, `RMC`).
    pub fn sentence_type(&self) -> &str {
        &self.sentence_type
    }

    /// Talker + type concatenated (e.g. `GNGGA`), the canonical identity.
    pub fn full_type(&self) -> String {
        format!("{}{}", self.talker, self.sentence_type)
    }

    /// Comma-separated data fields, in order, empties preserved.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Checksum byte: the transmitted value, or the computed XOR when the
    /// frame carried none (malformed hex reads as 0).
    pub fn checksum(&self) -> u8 {
        self.checksum
    }

    /// The exact received bytes, `$` through `*HH`, without CR/LF.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// True iff the frame carried a checksum and it matched the XOR of all
    /// bytes between `$` and `*`.
    pub fn is_valid(&self) -> bool {
        self.valid
    }
}
