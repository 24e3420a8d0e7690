//! Mining the tape client's textual output.
//!
//! The client interleaves progress chatter, warnings and errors on
//! stdout/stderr. The only reliable structure is the message code at the
//! start of diagnostic lines: `AN`, one letter, four digits, one letter
//! (`ANS1302E`, `ANR8944W`, ...). Totals and counters in the output are
//! never parsed.

/// Returns the message code opening `line`, if any.
///
/// Matches `AN` followed by a word character, four digits and a final word
/// character, anchored at the start of the line.
#[must_use]
pub fn message_code(line: &str) -> Option<&str> {
    let bytes = line.as_bytes();
    if bytes.len() < 8 || !line.starts_with("AN") {
        return None;
    }
    let word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    if word(bytes[2])
        && bytes[3..7].iter().all(u8::is_ascii_digit)
        && word(bytes[7])
    {
        Some(&line[..8])
    } else {
        None
    }
}

/// Iterates over `(code, line)` pairs for every diagnostic line in `output`.
pub fn scan_codes(output: &str) -> impl Iterator<Item = (&str, &str)> {
    output
        .lines()
        .filter_map(|line| message_code(line).map(|code| (code, line)))
}

/// Collects the diagnostic lines of `output`, for error logging.
#[must_use]
pub fn error_lines(output: &str) -> Vec<&str> {
    scan_codes(output).map(|(_, line)| line).collect()
}

/// Extracts the single-quoted path from a message line.
///
/// `ANS1345E` reports an already-deleted object as
/// `ANS1345E No objects on server match query for '<path>'`; the path is the
/// text between the final pair of single quotes. Returns `None` when the
/// line carries no quoted path, in which case callers must fall back to
/// reprocessing the whole batch.
#[must_use]
pub fn quoted_path(line: &str) -> Option<&str> {
    let end = line.rfind('\'')?;
    let start = line[..end].rfind('\'')?;
    if start == end {
        return None;
    }
    Some(&line[start + 1..end])
}
