//! Credentials handed to the engine by the credential provider.

use crate::{Result, SyncError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Everything needed to talk to one account's remote storage.
///
/// Field names on the wire follow the credential provider's JSON.
#[derive(Clone, Serialize, Deserialize)]
pub struct CredentialBundle {
    #[serde(rename = "URL")]
    pub endpoint: String,
    pub assertion: String,
    #[serde(rename = "xClientState")]
    pub client_state: String,
    /// Hex-encoded account root secret.
    #[serde(rename = "kB")]
    pub kb: String,
}

impl CredentialBundle {
    pub fn new(
        endpoint: impl Into<String>,
        assertion: impl Into<String>,
        client_state: impl Into<String>,
        kb: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            assertion: assertion.into(),
            client_state: client_state.into(),
            kb: kb.into(),
        }
    }

    /// Build a bundle from untyped provider output, naming the first field
    /// that is missing or not a string.
    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value.as_object().ok_or_else(|| {
            SyncError::InvalidConfiguration("options should be an Object".to_string())
        })?;

        let field = |name: &str| -> Result<String> {
            obj.get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    SyncError::InvalidConfiguration(format!("options.{} should be a String", name))
                })
        };

        let bundle = Self {
            endpoint: field("URL")?,
            assertion: field("assertion")?,
            client_state: field("xClientState")?,
            kb: field("kB")?,
        };
        bundle.validate()?;
        Ok(bundle)
    }

    /// Reject bundles the engine cannot possibly use.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("URL", &self.endpoint),
            ("assertion", &self.assertion),
            ("xClientState", &self.client_state),
            ("kB", &self.kb),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(SyncError::InvalidConfiguration(format!(
                    "options.{} should not be empty",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Account scope for checkpoints.
    pub fn account(&self) -> &str {
        &self.client_state
    }
}

impl fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("endpoint", &self.endpoint)
            .field("client_state", &self.client_state)
            .finish_non_exhaustive()
    }
}
