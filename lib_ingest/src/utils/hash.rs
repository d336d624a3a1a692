use sha2::{Digest, Sha256};

/// Hex SHA-256 over the given parts, each terminated by a NUL byte so that
/// `("ab", "c")` and `("a", "bc")` never collide.
pub fn correlation_key<S: AsRef<str>>(parts: &[S]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref().as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Stable identifier for the event produced from one raw message.
pub fn event_id(reader_id: &str, message_id: &str) -> String {
    let mut key = correlation_key(&[reader_id, message_id]);
    key.truncate(16);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_stable_and_separated() {
        let a = correlation_key(&["orig-1", "host-a"]);
        assert_eq!(a, correlation_key(&["orig-1", "host-a"]));
        assert_eq!(a.len(), 64);
        assert_ne!(correlation_key(&["ab", "c"]), correlation_key(&["a", "bc"]));
    }

    #[test]
    fn event_ids_are_short() {
        assert_eq!(event_id("r1", "m1").len(), 16);
        assert_ne!(event_id("r1", "m1"), event_id("r2", "m1"));
    }
}
