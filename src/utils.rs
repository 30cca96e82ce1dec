//! Identifier generation

use bech32::Bech32m;
use uuid7::uuid7;

// construct a unique, time-ordered id then encode using bech32 under the given prefix
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Prefixed id for a record kind. The prefixes are static and valid, so the
/// fallback to a bare uuid only guards against a bech32 API failure.
pub(crate) fn new_id(prefix: &str) -> String {
    new_uuid_to_bech32(prefix).unwrap_or_else(|_| format!("{prefix}{}", uuid7()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_prefix_and_are_unique() {
        let a = new_id("book_");
        let b = new_id("book_");

        assert!(a.starts_with("book_1"));
        assert_ne!(a, b);
    }

    #[test]
    fn empty_prefix_is_rejected() {
        assert!(new_uuid_to_bech32("").is_err());
    }
}
