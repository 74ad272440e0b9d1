use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = livecast_common::id::prefixed_ulid("live");
/// assert!(id.starts_with("live_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Well-known ID prefixes.
pub mod prefix {
    /// Session ids generated optimistically by a publishing client.
    pub const SESSION: &str = "live";
    /// Gateway connection ids.
    pub const CONNECTION: &str = "conn";
}
