use serde::{Deserialize, Serialize};

/// One (username, password) pair considered during a probe, with a label
/// recording where it came from for the attempt narrative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
    pub label: String,
}

impl Credential {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            label: label.into(),
        }
    }

    /// Identity for deduplication: the pair, not the label.
    pub fn key(&self) -> (&str, &str) {
        (&self.username, &self.password)
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }
}
