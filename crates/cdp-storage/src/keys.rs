//! Standard key patterns.

/// Key layout shared by every worker process.
pub struct KeyPatterns;

impl KeyPatterns {
    /// Profile mutex key.
    #[must_use]
    pub fn profile_lock(profile_id: &str) -> String {
        format!("profileflow:lock:profile:{profile_id}")
    }

    /// Session mutex key.
    #[must_use]
    pub fn session_lock(session_id: &str) -> String {
        format!("profileflow:lock:session:{session_id}")
    }

    /// Generic mutex key in a namespace.
    #[must_use]
    pub fn lock(namespace: &str, id: &str) -> String {
        format!("profileflow:lock:{namespace}:{id}")
    }

    /// Cache key.
    #[must_use]
    pub fn cache(namespace: &str, key: &str) -> String {
        format!("profileflow:cache:{namespace}:{key}")
    }
}
