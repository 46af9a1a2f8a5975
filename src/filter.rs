//! Sentence-type allow/block filtering.

use std::collections::HashSet;

use crate::config::{FilterConfig, FilterMode};
use crate::sentence::NmeaSentence;

/// Immutable allow/block policy over sentence identifiers.
///
/// Identifiers may be a full type (`GNGGA`) or a bare type (`GGA`); a
/// sentence matches a set when either form is a member.
#[derive(Debug)]
pub struct SentenceFilter {
    mode:  FilterMode,
    allow: HashSet<String>,
    block: HashSet<String>,
}

impl SentenceFilter {
    pub fn new(cfg: &FilterConfig) -> Self {
        SentenceFilter {
            mode:  cfg.mode,
            allow: cfg.allow.iter().map(|s| s.to_ascii_uppercase()).collect(),
            block: cfg.block.iter().map(|s| s.to_ascii_uppercase()).collect(),
        }
    }

    /// Pass-everything filter.
    pub fn allow_all() -> Self {
        SentenceFilter {
            mode:  FilterMode::AllowAll,
            allow: HashSet::new(),
            block: HashSet::new(),
        }
    }

    pub fn allowed(&self, sentence: &NmeaSentence) -> bool {
        match self.mode {
            FilterMode::AllowAll => true,
            // An empty allow-list admits everything so a blank config
            // cannot silence the bridge.
            FilterMode::AllowList => {
                self.allow.is_empty() || Self::matches(&self.allow, sentence)
            }
            FilterMode::BlockList => !Self::matches(&self.block, sentence),
        }
    }

    fn matches(set: &HashSet<String>, sentence: &NmeaSentence) -> bool {
        set.contains(&sentence.full_type()) || set.contains(sentence.sentence_type())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_chunk;
    use chrono::Utc;

    fn gga() -> NmeaSentence {
        let line = "$GNGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,47.0,M,,*51\r\n";
        parse_chunk(line.as_bytes(), Utc::now()).remove(0)
    }

    fn rmc() -> NmeaSentence {
        let line =
            "$GNRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*74\r\n";
        parse_chunk(line.as_bytes(), Utc::now()).remove(0)
    }

    fn filter(mode: FilterMode, allow: &[&str], block: &[&str]) -> SentenceFilter {
        SentenceFilter::new(&FilterConfig {
            mode,
            allow: allow.iter().map(|s| s.to_string()).collect(),
            block: block.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[test]
    fn allow_all_accepts() {
        assert!(SentenceFilter::allow_all().allowed(&gga()));
    }

    #[test]
    fn empty_allow_list_accepts() {
        let f = filter(FilterMode::AllowList, &[], &[]);
        assert!(f.allowed(&gga()));
        assert!(f.allowed(&rmc()));
    }

    #[test]
    fn allow_list_matches_bare_and_full_type() {
        let bare = filter(FilterMode::AllowList, &["GGA"], &[]);
        assert!(bare.allowed(&gga()));
        assert!(!bare.allowed(&rmc()));

        let full = filter(FilterMode::AllowList, &["GNGGA"], &[]);
        assert!(full.allowed(&gga()));
        assert!(!full.allowed(&rmc()));
    }

    #[test]
    fn empty_block_list_accepts() {
        let f = filter(FilterMode::BlockList, &[], &[]);
        assert!(f.allowed(&gga()));
    }

    #[test]
    fn block_list_rejects_only_members() {
        let f = filter(FilterMode::BlockList, &[], &["GGA"]);
        assert!(!f.allowed(&gga()));
        assert!(f.allowed(&rmc()));
    }

    #[test]
    fn identifiers_match_case_insensitively() {
        let f = filter(FilterMode::AllowList, &["gga"], &[]);
        assert!(f.allowed(&gga()));
    }
}
