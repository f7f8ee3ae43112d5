//! Unicode code point whitelist
//!
//! Only code points inside the configured ranges (minus the blacklist)
//! pass through. Zero-width characters and C0/C1 controls are removed
//! unconditionally — they are invisible carriers for homoglyph and
//! injection tricks and never legitimate in a JSON-RPC payload crossing
//! this proxy. Iteration is by Unicode scalar value, so astral-plane
//! characters are classified as single code points.

use crate::config::WhitelistConfig;
use std::collections::BTreeSet;

/// Closed set of removal reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WhitelistViolation {
    ZeroWidthRemoved,
    ControlRemoved,
    UnicodeRemoved,
    NonWhitelistedRemoved,
}

impl WhitelistViolation {
    pub fn as_str(&self) -> &'static str {
        match self {
            WhitelistViolation::ZeroWidthRemoved => "zero_width_removed",
            WhitelistViolation::ControlRemoved => "control_removed",
            WhitelistViolation::UnicodeRemoved => "unicode_removed",
            WhitelistViolation::NonWhitelistedRemoved => "non_whitelisted_removed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhitelistOutput {
    pub out: String,
    pub violations: BTreeSet<WhitelistViolation>,
}

/// Read-only after construction; shared across connections.
#[derive(Debug, Clone)]
pub struct CharacterWhitelist {
    enabled: bool,
    ranges: Vec<(u32, u32)>,
    blacklist: Vec<u32>,
}

impl CharacterWhitelist {
    pub fn new(config: &WhitelistConfig) -> Self {
        Self {
            enabled: config.enabled,
            ranges: config.allowed_ranges.iter().map(|r| (r[0], r[1])).collect(),
            blacklist: config.blacklist.clone(),
        }
    }

    pub fn filter(&self, s: &str) -> WhitelistOutput {
        if !self.enabled {
            return WhitelistOutput { out: s.to_string(), violations: BTreeSet::new() };
        }
        let mut out = String::with_capacity(s.len());
        let mut violations = BTreeSet::new();
        for c in s.chars() {
            let cp = c as u32;
            // Invisible and control classes are detected independently
            // of the configured ranges so the violation tag is specific.
            if is_zero_width(cp) {
                violations.insert(WhitelistViolation::ZeroWidthRemoved);
                continue;
            }
            if is_control(cp) {
                violations.insert(WhitelistViolation::ControlRemoved);
                continue;
            }
            if self.is_allowed(cp) {
                out.push(c);
            } else if cp > 0x7F {
                violations.insert(WhitelistViolation::UnicodeRemoved);
            } else {
                violations.insert(WhitelistViolation::NonWhitelistedRemoved);
            }
        }
        WhitelistOutput { out, violations }
    }

    /// Effective allow set: (union of ranges) minus blacklist.
    fn is_allowed(&self, cp: u32) -> bool {
        if self.blacklist.contains(&cp) {
            return false;
        }
        self.ranges.iter().any(|&(lo, hi)| cp >= lo && cp <= hi)
    }
}

/// U+200B..U+200D, U+FEFF, U+2060, U+180E, and the U+2000..U+200A
/// spaces family.
fn is_zero_width(cp: u32) -> bool {
    matches!(cp, 0x200B..=0x200D | 0xFEFF | 0x2060 | 0x180E | 0x2000..=0x200A)
}

/// C0 and C1 controls excluding tab, LF, CR (those are governed by the
/// configured ranges instead).
fn is_control(cp: u32) -> bool {
    if matches!(cp, 0x09 | 0x0A | 0x0D) {
        return false;
    }
    matches!(cp, 0x00..=0x1F | 0x7F..=0x9F)
}
