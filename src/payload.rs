use serde::{Deserialize, Serialize};

/// Secret data key recording who generated the stored passphrase.
pub const GENERATED_BY_KEY: &str = "generated_by";
/// Provenance marker for passphrases generated on the machine itself.
pub const TPM_GENERATED: &str = "tpm";
/// Prefix of the error sent when a matched partition has no secret yet.
pub const NO_SECRET_PREFIX: &str = "No secret found";

/// The JSON document carried in every data frame.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Payload {
    pub fn passphrase(passphrase: impl Into<String>, generated_by: Option<String>) -> Self {
        Self {
            passphrase: Some(passphrase.into()),
            generated_by,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn has_passphrase(&self) -> bool {
        self.passphrase.as_deref().map_or(false, |p| !p.is_empty())
    }

    pub fn has_error(&self) -> bool {
        self.error.as_deref().map_or(false, |e| !e.is_empty())
    }

    pub fn no_match(identity: &str) -> Self {
        Self::error(format!("Invalid hash: {identity}"))
    }

    pub fn quarantined(label: &str) -> Self {
        Self::error(format!("quarantined: {label}"))
    }

    pub fn no_secret(identity: &str, label: &str) -> Self {
        Self::error(format!("{NO_SECRET_PREFIX} for {identity} and {label}"))
    }
}
