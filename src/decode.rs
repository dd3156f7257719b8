//! Turning captured process output into storable text.

/// Decode raw process output.
///
/// Tries UTF-8 and falls back to a lowercase hex dump so the result is
/// always representable as text.
pub fn decode_output(raw: &[u8]) -> String {
    // 7-bit ASCII is a subset of UTF-8, so this also covers plain ASCII.
    if let Ok(text) = std::str::from_utf8(raw) {
        return text.to_string();
    }
    tracing::debug!(len = raw.len(), "Output is not valid text, storing as hex");
    hex::encode(raw)
}
