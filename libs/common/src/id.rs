use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = chat_common::id::prefixed_ulid("conn");
/// assert!(id.starts_with("conn_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Well-known ID prefixes.
pub mod prefix {
    /// A single live gateway connection.
    pub const CONNECTION: &str = "conn";
    /// An opaque client session token.
    pub const SESSION: &str = "cst";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixed_ulid_format() {
        let id = prefixed_ulid(prefix::CONNECTION);
        assert!(id.starts_with("conn_"));
        // ULID is 26 chars, plus prefix + underscore
        assert_eq!(id.len(), 5 + 26);
    }

    #[test]
    fn ids_are_unique() {
        let a = prefixed_ulid(prefix::CONNECTION);
        let b = prefixed_ulid(prefix::CONNECTION);
        assert_ne!(a, b);
    }
}
