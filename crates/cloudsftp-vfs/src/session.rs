//! Per-session backend identity.

use std::fmt;

/// The backend user a session acts as, plus its bearer token.
///
/// Established once at SSH authentication and bound into the session's
/// [`crate::Dispatcher`]. Never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub user_id: String,
    pub token: String,
}

impl SessionIdentity {
    pub fn new(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            token: token.into(),
        }
    }
}

impl fmt::Debug for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionIdentity")
            .field("user_id", &self.user_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_hides_token() {
        let id = SessionIdentity::new("u-1", "very-secret");
        let shown = format!("{id:?}");
        assert!(shown.contains("u-1"));
        assert!(!shown.contains("very-secret"));
    }
}
