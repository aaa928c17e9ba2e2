//! Local identity: short numeric pairing codes and qualified endpoint names.

use rand::Rng;

/// Placeholder prefix used when the caller supplies none. Every machine on
/// the same signaling namespace must share the prefix for codes to resolve.
pub const DEFAULT_PREFIX: &str = "PAIRCODE";

/// Default number of decimal digits in a short id.
pub const DEFAULT_SHORT_ID_LEN: usize = 6;

/// Separator between prefix and short id in a qualified id.
pub const SEPARATOR: char = '_';

/// Generate a random short id: `len` decimal digits.
pub fn generate_short_id(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}

/// Compose the globally-addressable endpoint name: `prefix + "_" + short_id`.
pub fn qualify(prefix: &str, short_id: &str) -> String {
    format!("{prefix}{SEPARATOR}{short_id}")
}

/// Extract the short id from a qualified id (component after the separator).
/// Returns None if the id carries no separator.
pub fn extract_short_id(qualified: &str) -> Option<&str> {
    qualified.split(SEPARATOR).nth(1)
}

/// A machine's local identity. Generated once at initialization; immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    short_id: String,
    qualified_id: String,
}

impl LocalIdentity {
    /// Generate a fresh identity under `prefix` with a random short id.
    pub fn generate(prefix: &str, short_id_len: usize) -> Self {
        Self::from_short_id(prefix, generate_short_id(short_id_len))
    }

    /// Build an identity from a caller-chosen short id (e.g. rejoining
    /// under a previously shared code).
    pub fn from_short_id(prefix: &str, short_id: impl Into<String>) -> Self {
        let short_id = short_id.into();
        let qualified_id = qualify(prefix, &short_id);
        Self {
            short_id,
            qualified_id,
        }
    }

    /// The human-shareable numeric code.
    pub fn short_id(&self) -> &str {
        &self.short_id
    }

    /// The full endpoint name used on the transport.
    pub fn qualified_id(&self) -> &str {
        &self.qualified_id
    }
}
