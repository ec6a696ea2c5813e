use std::collections::HashMap;

/// Session-key registry: opaque tokens minted by the auth frontend, mapped
/// to the username they authorize. Only the control-loop task touches this.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<u32, String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, displacing any prior session for the same user.
    ///
    /// Returns `true` when an older session was removed; the caller is
    /// expected to announce the displacement so the prior login gets booted.
    /// The login itself already happened upstream, so rejecting here would
    /// be announcing a lie.
    pub fn set(&mut self, session_key: u32, username: &str) -> bool {
        let displaced = self
            .sessions
            .iter()
            .find(|(_, u)| u.as_str() == username)
            .map(|(k, _)| *k);
        if let Some(old_key) = displaced {
            self.sessions.remove(&old_key);
        }
        self.sessions.insert(session_key, username.to_string());
        displaced.is_some()
    }

    /// First session key registered for `username`, if any.
    pub fn find_key(&self, username: &str) -> Option<u32> {
        self.sessions
            .iter()
            .find(|(_, u)| u.as_str() == username)
            .map(|(k, _)| *k)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[cfg(test)]
    pub fn get(&self, session_key: u32) -> Option<&str> {
        self.sessions.get(&session_key).map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_login_displaces_the_first() {
        let mut reg = SessionRegistry::new();
        assert!(!reg.set(100, "alice"));
        assert!(reg.set(200, "alice"));

        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get(200), Some("alice"));
        assert_eq!(reg.get(100), None);
        assert_eq!(reg.find_key("alice"), Some(200));
    }

    #[test]
    fn distinct_users_coexist() {
        let mut reg = SessionRegistry::new();
        assert!(!reg.set(1, "alice"));
        assert!(!reg.set(2, "bob"));
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.find_key("bob"), Some(2));
        assert_eq!(reg.find_key("carol"), None);
    }
}
