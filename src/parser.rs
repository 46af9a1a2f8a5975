//! NMEA 0183 frame decoder.
//!
//! `parse_chunk` scans a received byte chunk for `$…<CR/LF>` frames and
//! yields one [`NmeaSentence`] per well-formed frame, in byte order.  The
//! decoder is stateless between calls: upstream transports are datagram-
//! framed (UDP) or deliver whole lines (TCP at NMEA cadence), so an
//! incomplete trailing frame in a chunk is dropped rather than buffered.

use chrono::{DateTime, Utc};
use log::trace;

use crate::sentence::NmeaSentence;

/// Shortest frame worth examining: `$XXYYY` and change.
const MIN_FRAME_LEN: usize = 6;
/// Shortest payload that can hold talker + type + separator.
const MIN_PAYLOAD_LEN: usize = 5;

/// Decode every complete NMEA frame contained in `bytes`.
///
/// Bytes before the first `$` are dropped, as is anything after the last
/// frame terminator.  Frames that fail the structural checks (too short,
/// no field separator) are skipped; frames with a bad or missing checksum
/// are still yielded with `is_valid() == false` so the session can count
/// them.
pub fn parse_chunk(bytes: &[u8], received_at: DateTime<Utc>) -> Vec<NmeaSentence> {
    scan_chunk(bytes, received_at).0
}

/// Like [`parse_chunk`], but also reports how many terminated candidate
/// frames were structurally malformed (for the parse-error counter).
pub(crate) fn scan_chunk(
    bytes: &[u8],
    received_at: DateTime<Utc>,
) -> (Vec<NmeaSentence>, u64) {
    let mut sentences = Vec::new();
    let mut malformed = 0;
    let mut i = 0;

    while i < bytes.len() {
        let start = match bytes[i..].iter().position(|&b| b == b'$') {
            Some(p) => i + p,
            None => break,
        };
        let term = match bytes[start..].iter().position(|&b| b == b'\r' || b == b'\n') {
            Some(p) => start + p,
            // Unterminated tail: discard and wait for the next chunk.
            None => break,
        };

        let frame = &bytes[start..term];
        if frame.len() < MIN_FRAME_LEN {
            malformed += 1;
        } else if let Some(s) = parse_frame(frame, received_at) {
            sentences.push(s);
        } else {
            trace!("skipping malformed frame ({} bytes)", frame.len());
            malformed += 1;
        }

        // Step over the whole CR/LF run before resuming the scan.
        i = term;
        while i < bytes.len() && (bytes[i] == b'\r' || bytes[i] == b'\n') {
            i += 1;
        }
    }

    (sentences, malformed)
}

/// Decode one candidate frame (`$` at index 0, no CR/LF).
fn parse_frame(frame: &[u8], received_at: DateTime<Utc>) -> Option<NmeaSentence> {
    // Split on the last '*'.  Two hex digits must follow for the frame to
    // carry a checksum; otherwise everything after '$' is payload.
    let star = frame.iter().rposition(|&b| b == b'*');
    let (payload, transmitted) = match star {
        Some(p) if frame.len() >= p + 3 => {
            (&frame[1..p], Some(parse_hex_pair(frame[p + 1], frame[p + 2])))
        }
        _ => (&frame[1..], None),
    };

    if payload.len() < MIN_PAYLOAD_LEN {
        return None;
    }
    // Talker is payload[0..2], type runs from index 2 to the first comma,
    // so the comma must sit beyond index 2.
    let comma = payload.iter().position(|&b| b == b',')?;
    if comma <= 2 {
        return None;
    }

    let computed = payload.iter().fold(0u8, |acc, &b| acc ^ b);
    let (checksum, valid) = match transmitted {
        Some(Some(t)) => (t, t == computed),
        // '*' present but the two digits were not hex.
        Some(None) => (0, false),
        // No checksum transmitted: report the computed value.
        None => (computed, false),
    };

    let talker = bytes_to_string(&payload[..2]);
    let sentence_type = bytes_to_string(&payload[2..comma]);
    let fields = payload[comma + 1..]
        .split(|&b| b == b',')
        .map(bytes_to_string)
        .collect();

    Some(NmeaSentence::new(
        talker,
        sentence_type,
        fields,
        checksum,
        frame.to_vec(),
        received_at,
        valid,
    ))
}

/// Decode two hex digits, accepting both cases.
fn parse_hex_pair(hi: u8, lo: u8) -> Option<u8> {
    Some(hex_val(hi)? << 4 | hex_val(lo)?)
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Fields keep their original byte values; bytes outside ASCII map onto
/// the matching one-byte chars rather than being replaced.
fn bytes_to_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}
