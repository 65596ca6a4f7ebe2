//! Fetches or idempotently creates the secret backing a matched partition.

use crate::payload::GENERATED_BY_KEY;
use crate::store::{RecordStore, Result, SecretRecord};
use crate::volume::SecretRef;
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(SecretRecord),
    /// A secret was already stored, possibly by a concurrent writer. Holds the
    /// stored value, never the submitted one.
    AlreadyExisted(SecretRecord),
}

impl CreateOutcome {
    pub fn record(&self) -> &SecretRecord {
        match self {
            CreateOutcome::Created(record) | CreateOutcome::AlreadyExisted(record) => record,
        }
    }
}

#[derive(Clone)]
pub struct SecretMaterializer {
    store: Arc<dyn RecordStore>,
    namespace: String,
}

impl SecretMaterializer {
    pub fn new(store: Arc<dyn RecordStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    /// `Ok(None)` when the secret does not exist; `Err` only for store
    /// failures.
    pub async fn get_existing(&self, name: &str) -> Result<Option<SecretRecord>> {
        match self.store.get_secret(&self.namespace, name).await {
            Ok(secret) => Ok(Some(secret)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn create_if_absent(
        &self,
        secret: &SecretRef,
        passphrase: &str,
        generated_by: Option<&str>,
    ) -> Result<CreateOutcome> {
        if let Some(existing) = self.get_existing(&secret.name).await? {
            return Ok(CreateOutcome::AlreadyExisted(existing));
        }

        let record = SecretRecord::new(&self.namespace, &secret.name)
            .with(&secret.path, passphrase)
            .with(GENERATED_BY_KEY, generated_by.unwrap_or_default());

        match self.store.create_secret(&record).await {
            Ok(()) => Ok(CreateOutcome::Created(record)),
            Err(e) if e.is_already_exists() => {
                // Lost a race; report what the winner stored.
                let winner = self.store.get_secret(&self.namespace, &secret.name).await?;
                Ok(CreateOutcome::AlreadyExisted(winner))
            }
            Err(e) => Err(e),
        }
    }
}
