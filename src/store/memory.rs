use super::{RecordStore, Result, SecretRecord, StoreError};
use crate::volume::VolumeRecord;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// In-process store.
///
/// Used for development and tests; `set_available(false)` simulates a
/// backend outage for every operation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
    secret_reads: AtomicUsize,
    secret_writes: AtomicUsize,
}

#[derive(Debug, Default)]
struct Inner {
    volumes: HashMap<String, Vec<VolumeRecord>>,
    secrets: HashMap<(String, String), SecretRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<()> {
        match self.unavailable.load(Ordering::SeqCst) {
            true => Err(StoreError::Unavailable("memory store switched off".into())),
            false => Ok(()),
        }
    }

    pub fn add_volume(&self, namespace: &str, record: VolumeRecord) {
        self.lock()
            .volumes
            .entry(namespace.to_owned())
            .or_default()
            .push(record);
    }

    pub fn insert_secret(&self, secret: SecretRecord) {
        self.lock()
            .secrets
            .insert((secret.namespace.clone(), secret.name.clone()), secret);
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<SecretRecord> {
        self.lock()
            .secrets
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
    }

    pub fn secret_count(&self, namespace: &str) -> usize {
        self.lock()
            .secrets
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .count()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Number of secret get calls served so far.
    pub fn secret_reads(&self) -> usize {
        self.secret_reads.load(Ordering::SeqCst)
    }

    /// Number of secret create calls attempted so far.
    pub fn secret_writes(&self) -> usize {
        self.secret_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn list_volumes(&self, namespace: &str) -> Result<Vec<VolumeRecord>> {
        self.check_available()?;
        Ok(self.lock().volumes.get(namespace).cloned().unwrap_or_default())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<SecretRecord> {
        self.secret_reads.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        super::validate_name(name)?;
        self.secret(namespace, name)
            .ok_or_else(|| StoreError::not_found(namespace, name))
    }

    async fn create_secret(&self, secret: &SecretRecord) -> Result<()> {
        self.secret_writes.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        super::validate_name(&secret.name)?;
        let mut inner = self.lock();
        let key = (secret.namespace.clone(), secret.name.clone());
        if inner.secrets.contains_key(&key) {
            return Err(StoreError::already_exists(&secret.namespace, &secret.name));
        }
        inner.secrets.insert(key, secret.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[tokio::test]
    async fn create_never_overwrites() -> Result<()> {
        let store = MemoryStore::new();
        store
            .create_secret(&SecretRecord::new("ns", "s1").with("passphrase", "one"))
            .await?;
        let second = store
            .create_secret(&SecretRecord::new("ns", "s1").with("passphrase", "two"))
            .await;
        assert!(second.map_err(|e| e.is_already_exists()).unwrap_err());
        let stored = store.get_secret("ns", "s1").await?;
        assert_eq!(stored.get("passphrase"), Some("one"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_secret_is_not_found() {
        let store = MemoryStore::new();
        let err = store.get_secret("ns", "nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn outage_fails_every_call() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.list_volumes("ns").await,
            Err(StoreError::Unavailable(_))
        ));
        let err = store.get_secret("ns", "s").await.unwrap_err();
        assert!(!err.is_not_found());
    }

    #[tokio::test]
    async fn volumes_are_scoped_by_namespace() -> Result<()> {
        let store = MemoryStore::new();
        store.add_volume(
            "a",
            VolumeRecord {
                name: "v".into(),
                hardware_hash: "H".into(),
                ..Default::default()
            },
        );
        assert_eq!(store.list_volumes("a").await?.len(), 1);
        assert!(store.list_volumes("b").await?.is_empty());
        Ok(())
    }
}
