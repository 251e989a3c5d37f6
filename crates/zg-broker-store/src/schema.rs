//! Column family definitions for the `RocksDB` backend.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Usage records, keyed by record ID (ULID, so creation-ordered).
    pub const USAGE_RECORDS: &str = "usage_records";

    /// Highest nonce seen per pair, keyed by `user || provider`.
    /// Value is the nonce as 8 big-endian bytes.
    pub const PAIR_NONCES: &str = "pair_nonces";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![cf::USAGE_RECORDS, cf::PAIR_NONCES]
}
