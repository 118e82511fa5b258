//! Wire protocol handling: framing, classification, and line checksums.

pub mod checksum;
pub mod classifier;
pub mod decoder;

pub use classifier::{Classified, ResponseClassifier};
pub use decoder::{DecodedUnit, FrameDecoder};

/// Strip an optional `N<digits>` line-number prefix, returning the number
/// (if any) and the remainder.
pub fn split_line_number(line: &str) -> (Option<u64>, &str) {
    let trimmed = line.trim_start();
    let mut chars = trimmed.char_indices();
    match chars.next() {
        Some((_, 'N')) | Some((_, 'n')) => {}
        _ => return (None, line),
    }
    let digits_end = trimmed[1..]
        .find(|c: char| !c.is_ascii_digit())
        .map(|i| i + 1)
        .unwrap_or(trimmed.len());
    if digits_end == 1 {
        return (None, line);
    }
    let number = trimmed[1..digits_end].parse().ok();
    (number, trimmed[digits_end..].trim_start())
}

/// True when the text is control-class: an optional line-number prefix
/// followed by `{`, `}`, `!`, `~`, or a control byte in 0x01–0x19. Such
/// content is routed to the control channel and bypasses the send buffer.
pub fn is_control_class(text: &str) -> bool {
    let (_, rest) = split_line_number(text);
    match rest.chars().next() {
        Some(c) => matches!(c, '{' | '}' | '!' | '~') || ('\u{01}'..='\u{19}').contains(&c),
        None => false,
    }
}

/// True when the text consists solely of real-time bytes (`!`, `~`, `%`,
/// ^C, ^D). The device never acknowledges these, so they must not count
/// against response correlation.
pub fn is_realtime_only(text: &str) -> bool {
    !text.is_empty()
        && text
            .trim_end_matches(['\r', '\n'])
            .chars()
            .all(|c| matches!(c, '!' | '~' | '%' | '\u{03}' | '\u{04}'))
}

/// True for a queue-clear command (`{clr:n}` / `{clear:null}`, optionally
/// line-number-prefixed). Queue clears must travel in-band with queued
/// motion, so they route to the data channel when one exists.
pub fn is_queue_clear(text: &str) -> bool {
    let (_, rest) = split_line_number(text);
    let rest = rest.trim_end_matches(['\r', '\n']);
    let Some(inner) = rest.strip_prefix('{').and_then(|r| r.strip_suffix('}')) else {
        return false;
    };
    let Some((key, value)) = inner.split_once(':') else {
        return false;
    };
    let key = key.trim().trim_matches('"');
    let value = value.trim().trim_matches('"');
    matches!(key, "clr" | "clear") && matches!(value, "n" | "null")
}
