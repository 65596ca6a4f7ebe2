//! Record store access.
//!
//! The broker reads [`VolumeRecord`]s and reads or creates [`SecretRecord`]s
//! through the [`RecordStore`] trait. Stores must report a missing secret as
//! [`StoreError::NotFound`] and a losing concurrent create as
//! [`StoreError::AlreadyExists`]; everything else is treated as the backend
//! being unavailable.

use crate::volume::VolumeRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

const MAX_NAME_LEN: usize = 253;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("secret `{namespace}/{name}` not found")]
    NotFound { namespace: String, name: String },
    #[error("secret `{namespace}/{name}` already exists")]
    AlreadyExists { namespace: String, name: String },
    #[error("invalid object name `{0}`")]
    InvalidName(String),
    #[error("record store unavailable: {0}")]
    Unavailable(String),
    #[error("malformed record `{}`", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }

    /// Whether the same call may succeed later. Bad names and broken records
    /// stay broken until an operator fixes them.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Io(_))
    }

    pub(crate) fn not_found(namespace: &str, name: &str) -> Self {
        StoreError::NotFound {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
        }
    }

    pub(crate) fn already_exists(namespace: &str, name: &str) -> Self {
        StoreError::AlreadyExists {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
        }
    }
}

pub type Result<T, E = StoreError> = core::result::Result<T, E>;

/// A named bag of string data, e.g. a passphrase and its provenance.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRecord {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl SecretRecord {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            data: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Point in time listing of every volume record in `namespace`.
    async fn list_volumes(&self, namespace: &str) -> Result<Vec<VolumeRecord>>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<SecretRecord>;

    /// Creates `secret`, failing with [`StoreError::AlreadyExists`] if a
    /// secret of that name is already present. Never overwrites.
    async fn create_secret(&self, secret: &SecretRecord) -> Result<()>;
}

/// Object names are lower-case alphanumerics, `-` and `.`, starting and
/// ending alphanumeric.
pub fn validate_name(name: &str) -> Result<()> {
    let valid_char = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
    let ok = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.chars().all(|c| valid_char(c) || c == '-' || c == '.')
        && name.starts_with(valid_char)
        && name.ends_with(valid_char);
    match ok {
        true => Ok(()),
        false => Err(StoreError::InvalidName(name.to_owned())),
    }
}
