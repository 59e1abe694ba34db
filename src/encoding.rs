//! Percent-encoding for URL components (RFC 3986).

/// Encode every byte of `input` except RFC 3986 unreserved characters and the
/// bytes listed in `keep`.
pub(crate) fn percent_encode(input: &str, keep: &[u8]) -> String {
    // ---
    const HEX: &[u8; 16] = b"0123456789ABCDEF";

    let mut out = String::with_capacity(input.len());
    for &b in input.as_bytes() {
        let unreserved = b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~');
        if unreserved || keep.contains(&b) {
            out.push(b as char);
        } else {
            out.push('%');
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 0x0f) as usize] as char);
        }
    }
    out
}
