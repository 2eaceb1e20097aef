//! Tunnel id validation and random id generation.

use rand::Rng;

/// `^(?:[a-z0-9][a-z0-9-]{4,63}[a-z0-9]|[a-z0-9]{4,63})$`
///
/// Hand-rolled rather than pulled through the `regex` crate: the grammar is
/// small and fixed, and this runs on every control-plane creation request.
pub fn is_valid(id: &str) -> bool {
    let bytes = id.as_bytes();
    let len = bytes.len();
    if len < 4 {
        return false;
    }
    if !bytes.iter().all(|b| is_lower_alnum(*b) || *b == b'-') {
        return false;
    }
    let has_hyphen = bytes.contains(&b'-');
    if !has_hyphen {
        // A pure-alnum string matches either alternative: `[a-z0-9]{4,63}`
        // directly, or the first alternative with an all-alnum middle run
        // (1 + (4..=63) + 1 => 6..=65). The union of both is 4..=65.
        return len <= 65;
    }
    // `[a-z0-9][a-z0-9-]{4,63}[a-z0-9]`: 1 + (4..=63) + 1 => 6..=65 total,
    // with both ends alnum (hyphens only allowed in the middle run).
    (6..=65).contains(&len) && is_lower_alnum(bytes[0]) && is_lower_alnum(bytes[len - 1])
}

fn is_lower_alnum(b: u8) -> bool {
    b.is_ascii_lowercase() || b.is_ascii_digit()
}

/// Generate a random 10-character lowercase-hex id.
pub fn generate() -> String {
    let mut rng = rand::thread_rng();
    (0..10)
        .map(|_| {
            let n: u8 = rng.gen_range(0..16);
            std::char::from_digit(n as u32, 16).unwrap()
        })
        .collect()
}
