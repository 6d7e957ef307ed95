use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Opaque owner token stored in a lock record.
///
/// Release is only honored when the presented token equals the stored one,
/// so every acquisition attempt must use a fresh token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    /// Generate a timestamp-derived nonce: `<unix nanos>-<random 64 bits>`.
    pub fn generate() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        Self(format!("{:x}-{:016x}", nanos, fastrand::u64(..)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LockToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for LockToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
