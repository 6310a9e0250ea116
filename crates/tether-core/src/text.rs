use sha2::{Digest, Sha256};

/// Websocket close reasons must fit in a control frame payload.
pub const MAX_CLOSE_REASON_BYTES: usize = 123;

/// Merges a streamed chunk into the text accumulated so far.
///
/// Backends alternate between sending the full running text and sending true
/// deltas, so the chunk is classified against the buffer:
/// - the chunk extends the buffer: it replaces the buffer
/// - the buffer already holds the chunk as a prefix or suffix: the buffer is kept
/// - anything else is appended
pub fn merge_stream_text(buffer: &str, incoming: &str) -> String {
    if incoming.starts_with(buffer) {
        return incoming.to_string();
    }
    if buffer.starts_with(incoming) || buffer.ends_with(incoming) {
        return buffer.to_string();
    }
    let mut merged = String::with_capacity(buffer.len() + incoming.len());
    merged.push_str(buffer);
    merged.push_str(incoming);
    merged
}

/// Truncates to at most `max_bytes` without splitting a code point.
pub fn truncate_utf8(input: &str, max_bytes: usize) -> &str {
    if input.len() <= max_bytes {
        return input;
    }
    let mut end = max_bytes;
    while end > 0 && !input.is_char_boundary(end) {
        end -= 1;
    }
    &input[..end]
}

pub fn close_reason(reason: &str) -> String {
    truncate_utf8(reason, MAX_CLOSE_REASON_BYTES).to_string()
}

/// Collapses every whitespace run to one space and trims the ends.
pub fn normalize_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Short stable hex digest over the given parts, used for entry ids and dedupe keys.
pub fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    let digest = hasher.finalize();
    digest
        .iter()
        .take(12)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}
