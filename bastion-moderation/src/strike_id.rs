//! Short strike ids.
//!
//! A strike id is the audit-log message id written in lowercase base 36, so
//! every id can be traced back to the message that recorded the strike.

const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Encode a message id as a short strike id.
pub fn encode(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::with_capacity(13);
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    out.into_iter().map(char::from).collect()
}

/// Decode a short strike id back into the message id. Case-insensitive.
///
/// Returns `None` for empty input, characters outside `[0-9a-z]` and values
/// that do not fit in a `u64`.
pub fn decode(id: &str) -> Option<u64> {
    if id.is_empty() {
        return None;
    }
    id.chars().try_fold(0u64, |acc, c| {
        let digit = c.to_digit(36)?;
        acc.checked_mul(36)?.checked_add(u64::from(digit))
    })
}
