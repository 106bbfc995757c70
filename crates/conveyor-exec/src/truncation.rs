//! Output truncation for the stage output kept on the run record.

/// Keep the last `max_chars` characters (not bytes) of `output`.
///
/// Output within the limit is returned unchanged. Otherwise a marker line at
/// the start records how many characters were dropped.
pub fn truncate_tail(output: &str, max_chars: usize) -> String {
    let total = output.chars().count();
    if total <= max_chars {
        return output.to_string();
    }

    let removed = total - max_chars;
    let tail = &output[byte_offset(output, removed)..];
    format!("[... {} characters truncated ...]\n{}", removed, tail)
}

/// Byte index of the `n`th character, or the string length past the end.
fn byte_offset(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}
