use serde::{Deserialize, Serialize};

use crate::Protocol;

/// Immutable input to one probe: which service family to test, where, and the
/// credentials (if any) the operator supplied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Target {
    pub fn new(protocol: Protocol, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol,
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(
        mut self,
        username: Option<String>,
        password: Option<String>,
    ) -> Self {
        // Empty strings from import files mean "not supplied".
        self.username = username.filter(|u| !u.is_empty());
        self.password = password.filter(|p| !p.is_empty());
        self
    }

    /// `host:port` for log lines and dial sites.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
