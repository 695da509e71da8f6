//! Window key derivation.

use std::fmt;

/// A key that identifies one logical fixed-window counter.
///
/// The key is composed of the limiter's prefix and the caller's identifier.
/// The window length is deliberately not part of the key: the counter rolls
/// over when the stored entry expires.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    /// Namespace separating independent limiters
    pub prefix: String,
    /// Caller-supplied identifier (client IP, API key, ...)
    pub identifier: String,
}

impl WindowKey {
    /// Create a new window key.
    pub fn new(prefix: &str, identifier: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            identifier: identifier.to_string(),
        }
    }

    /// Render the key as stored in a backend.
    pub fn to_string_key(&self) -> String {
        format!("{}:{}", self.prefix, self.identifier)
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.prefix, self.identifier)
    }
}

/// Build the backend key for an identifier under a prefix.
///
/// `window_ms` is accepted so callers can pass a whole limit configuration
/// through, but it does not influence the key.
pub fn build_key(identifier: &str, prefix: &str, _window_ms: i64) -> String {
    WindowKey::new(prefix, identifier).to_string_key()
}
