//! ANSI escape sequence filter
//!
//! Strings crossing the proxy may carry terminal control sequences that
//! a client UI would interpret: cursor movement, screen clearing, title
//! changes, OSC 8 hyperlinks. The filter recognizes the structured
//! forms (CSI, OSC, DCS/SOS/PM/APC, save/restore cursor, the 8-bit CSI
//! introducer) and then removes any residual ESC byte, so no output
//! string ever contains 0x1B in strip mode.
//!
//! An unterminated OSC/DCS body is not a sequence: only the ESC byte is
//! dropped and the visible remainder is kept.

use crate::config::{AnsiAction, AnsiConfig};

const ESC: char = '\u{1B}';
const CSI_8BIT: char = '\u{9B}';
const BEL: char = '\u{07}';

/// Result of one filter pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnsiOutput {
    pub out: String,
    /// True when any escape sequence was found (and stripped, rejected,
    /// or encoded depending on the mode).
    pub removed: bool,
}

/// Read-only after construction; shared across connections.
#[derive(Debug, Clone)]
pub struct AnsiFilter {
    enabled: bool,
    action: AnsiAction,
}

impl AnsiFilter {
    pub fn new(config: &AnsiConfig) -> Self {
        Self { enabled: config.enabled, action: config.action }
    }

    pub fn from_action(action: AnsiAction) -> Self {
        Self { enabled: true, action }
    }

    /// Deterministic: the same input always produces the same output.
    pub fn filter(&self, s: &str) -> AnsiOutput {
        if !self.enabled || !contains_escape(s) {
            return AnsiOutput { out: s.to_string(), removed: false };
        }
        match self.action {
            AnsiAction::Strip => strip(s),
            AnsiAction::Reject => AnsiOutput { out: String::new(), removed: true },
            AnsiAction::Encode => encode(s),
        }
    }
}

fn contains_escape(s: &str) -> bool {
    s.chars().any(|c| c == ESC || c == CSI_8BIT)
}

fn strip(s: &str) -> AnsiOutput {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut removed = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == ESC {
            removed = true;
            i = skip_escape(&chars, i);
        } else if c == CSI_8BIT {
            removed = true;
            i = skip_csi_body(&chars, i + 1);
        } else {
            out.push(c);
            i += 1;
        }
    }
    AnsiOutput { out, removed }
}

fn encode(s: &str) -> AnsiOutput {
    let mut out = String::with_capacity(s.len() + 8);
    let mut removed = false;
    for c in s.chars() {
        match c {
            ESC => {
                removed = true;
                out.push_str("\\x1b");
            }
            CSI_8BIT => {
                removed = true;
                out.push_str("\\x9b");
            }
            _ => out.push(c),
        }
    }
    AnsiOutput { out, removed }
}

/// Returns the index just past the sequence starting at `chars[i] == ESC`.
/// Always consumes at least the ESC itself.
fn skip_escape(chars: &[char], i: usize) -> usize {
    match chars.get(i + 1) {
        // CSI: parameters then a final byte in 0x40..=0x7E. Covers SGR
        // and DEC private modes (the '?' is a parameter byte).
        Some('[') => skip_csi_body(chars, i + 2),
        // OSC: terminated by BEL or ST (ESC \).
        Some(']') => match find_osc_end(chars, i + 2) {
            Some(end) => end,
            None => i + 1,
        },
        // DCS / SOS / PM / APC: terminated by ST.
        Some('P') | Some('X') | Some('^') | Some('_') => match find_st(chars, i + 2) {
            Some(end) => end,
            None => i + 1,
        },
        // Save/restore cursor.
        Some('7') | Some('8') => i + 2,
        // Anything else: residual ESC removal only.
        _ => i + 1,
    }
}

fn skip_csi_body(chars: &[char], mut i: usize) -> usize {
    while let Some(&c) = chars.get(i) {
        let cp = c as u32;
        if (0x40..=0x7E).contains(&cp) {
            return i + 1;
        }
        // Parameter bytes 0x30..0x3F, intermediates 0x20..0x2F.
        if !(0x20..=0x3F).contains(&cp) {
            return i;
        }
        i += 1;
    }
    i
}

fn find_osc_end(chars: &[char], mut i: usize) -> Option<usize> {
    while let Some(&c) = chars.get(i) {
        if c == BEL {
            return Some(i + 1);
        }
        if c == ESC {
            return match chars.get(i + 1) {
                Some('\\') => Some(i + 2),
                _ => None,
            };
        }
        i += 1;
    }
    None
}

fn find_st(chars: &[char], mut i: usize) -> Option<usize> {
    while let Some(&c) = chars.get(i) {
        if c == ESC && chars.get(i + 1) == Some(&'\\') {
            return Some(i + 2);
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strip_filter() -> AnsiFilter {
        AnsiFilter::from_action(AnsiAction::Strip)
    }

    #[test]
    fn sgr_color_stripped() {
        let out = strip_filter().filter("\u{1b}[31mRED\u{1b}[0m");
        assert_eq!(out.out, "RED");
        assert!(out.removed);
    }

    #[test]
    fn plain_text_untouched() {
        let out = strip_filter().filter("hello world");
        assert_eq!(out.out, "hello world");
        assert!(!out.removed);
    }

    #[test]
    fn osc_title_with_bel() {
        let out = strip_filter().filter("a\u{1b}]0;evil title\u{07}b");
        assert_eq!(out.out, "ab");
    }

    #[test]
    fn osc_with_st_terminator() {
        let out = strip_filter().filter("a\u{1b}]8;;http://x\u{1b}\\b");
        assert_eq!(out.out, "ab");
    }

    #[test]
    fn unterminated_osc_keeps_visible_text() {
        let out = strip_filter().filter("a\u{1b}]0;title");
        assert_eq!(out.out, "a]0;title");
        assert!(out.removed);
    }

    #[test]
    fn dcs_stripped() {
        let out = strip_filter().filter("x\u{1b}Pq#0;2;0;0;0#0~~\u{1b}\\y");
        assert_eq!(out.out, "xy");
    }

    #[test]
    fn dec_private_mode_stripped() {
        let out = strip_filter().filter("x\u{1b}[?25ly");
        assert_eq!(out.out, "xy");
    }

    #[test]
    fn save_restore_cursor_stripped() {
        let out = strip_filter().filter("a\u{1b}7b\u{1b}8c");
        assert_eq!(out.out, "abc");
    }

    #[test]
    fn eight_bit_csi_stripped() {
        let out = strip_filter().filter("a\u{9b}31mb");
        assert_eq!(out.out, "ab");
    }

    #[test]
    fn lone_escape_removed() {
        let out = strip_filter().filter("a\u{1b}b");
        assert_eq!(out.out, "ab");
        assert!(out.removed);
    }

    #[test]
    fn no_escape_byte_survives_strip() {
        let nasty = "\u{1b}[2J\u{1b}]x\u{1b}\u{1b}[1;1H\u{9b}0mtext\u{1b}";
        let out = strip_filter().filter(nasty);
        assert!(!out.out.contains('\u{1b}'));
        assert!(!out.out.contains('\u{9b}'));
    }

    #[test]
    fn strip_is_idempotent() {
        let filter = strip_filter();
        let once = filter.filter("pre\u{1b}[31mmid\u{1b}[0mpost");
        let twice = filter.filter(&once.out);
        assert_eq!(once.out, twice.out);
        assert!(!twice.removed);
    }

    #[test]
    fn reject_mode_empties_output() {
        let filter = AnsiFilter::from_action(AnsiAction::Reject);
        let out = filter.filter("bad\u{1b}[31mtext");
        assert_eq!(out.out, "");
        assert!(out.removed);

        let clean = filter.filter("good text");
        assert_eq!(clean.out, "good text");
        assert!(!clean.removed);
    }

    #[test]
    fn encode_mode_makes_escapes_visible() {
        let filter = AnsiFilter::from_action(AnsiAction::Encode);
        let out = filter.filter("\u{1b}[31mRED");
        assert_eq!(out.out, "\\x1b[31mRED");
        assert!(out.removed);
    }

    #[test]
    fn disabled_filter_is_identity() {
        let filter = AnsiFilter::new(&AnsiConfig { enabled: false, action: AnsiAction::Strip });
        let input = "\u{1b}[31mRED\u{1b}[0m";
        let out = filter.filter(input);
        assert_eq!(out.out, input);
        assert!(!out.removed);
    }
}
