//! Directory backed record store.
//!
//! ```text
//! <root>/<namespace>/volumes/*.yaml    one VolumeRecord per file
//! <root>/<namespace>/secrets/<name>.yaml
//! ```
//!
//! Volumes are listed in file name order. Secrets are written to a temporary
//! file and hard linked into place, so a reader never sees a partial secret
//! and only the first of several racing writers succeeds.

use super::{validate_name, RecordStore, Result, SecretRecord, StoreError};
use crate::volume::VolumeRecord;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

const VOLUMES_DIR: &str = "volumes";
const SECRETS_DIR: &str = "secrets";

#[derive(Clone, Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, namespace: &str) -> Result<PathBuf> {
        validate_name(namespace)?;
        Ok(self.root.join(namespace))
    }

    fn secret_path(&self, namespace: &str, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self
            .namespace_dir(namespace)?
            .join(SECRETS_DIR)
            .join(format!("{name}.yaml")))
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

async fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(path).await?;
    file.write_all(contents).await?;
    file.sync_all().await
}

#[async_trait]
impl RecordStore for FileStore {
    async fn list_volumes(&self, namespace: &str) -> Result<Vec<VolumeRecord>> {
        let dir = self.namespace_dir(namespace)?.join(VOLUMES_DIR);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_yaml(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            let raw = fs::read_to_string(&path).await?;
            match serde_yaml::from_str::<VolumeRecord>(&raw) {
                Ok(record) => records.push(record),
                // A broken record can only fail to match, never widen access.
                Err(source) => tracing::warn!(
                    error = %StoreError::Malformed { path: path.clone(), source },
                    "skipping volume record"
                ),
            }
        }
        Ok(records)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<SecretRecord> {
        let path = self.secret_path(namespace, name)?;
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::not_found(namespace, name))
            }
            Err(e) => return Err(e.into()),
        };
        serde_yaml::from_str(&raw).map_err(|source| StoreError::Malformed { path, source })
    }

    async fn create_secret(&self, secret: &SecretRecord) -> Result<()> {
        let path = self.secret_path(&secret.namespace, &secret.name)?;
        let dir = path
            .parent()
            .ok_or_else(|| StoreError::InvalidName(secret.name.clone()))?;
        fs::create_dir_all(dir).await?;

        let tmp = dir.join(format!(".{}.{}.tmp", secret.name, uuid::Uuid::new_v4()));
        let contents = serde_yaml::to_string(secret)?;
        let linked = match write_private(&tmp, contents.as_bytes()).await {
            Ok(()) => fs::hard_link(&tmp, &path).await,
            Err(e) => Err(e),
        };
        fs::remove_file(&tmp).await.ok();

        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(StoreError::already_exists(
                &secret.namespace,
                &secret.name,
            )),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    fn declare(root: &Path, namespace: &str, file: &str, yaml: &str) -> Result<()> {
        let dir = root.join(namespace).join(VOLUMES_DIR);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(file), yaml)?;
        Ok(())
    }

    #[tokio::test]
    async fn lists_volumes_in_file_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        declare(dir.path(), "default", "b.yaml", "name: second\ntpmHash: H2\n")?;
        declare(dir.path(), "default", "a.yaml", "name: first\ntpmHash: H1\n")?;
        declare(dir.path(), "default", "notes.txt", "ignored")?;
        declare(dir.path(), "default", "c.yaml", "name: [broken")?;

        let store = FileStore::new(dir.path());
        let names: Vec<_> = store
            .list_volumes("default")
            .await?
            .into_iter()
            .map(|v| v.name)
            .collect();
        assert_eq!(names, vec!["first", "second"]);
        Ok(())
    }

    #[tokio::test]
    async fn missing_namespace_has_no_volumes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(FileStore::new(dir.path()).list_volumes("empty").await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn secrets_are_first_write_wins() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FileStore::new(dir.path());

        let err = store.get_secret("default", "vol1-root").await.unwrap_err();
        assert!(err.is_not_found());

        let first = SecretRecord::new("default", "vol1-root").with("passphrase", "abc");
        store.create_secret(&first).await?;
        let second = SecretRecord::new("default", "vol1-root").with("passphrase", "xyz");
        let err = store.create_secret(&second).await.unwrap_err();
        assert!(err.is_already_exists());

        assert_eq!(store.get_secret("default", "vol1-root").await?, first);

        let leftovers = std::fs::read_dir(dir.path().join("default").join(SECRETS_DIR))?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
        Ok(())
    }

    #[tokio::test]
    async fn rejects_path_traversal() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FileStore::new(dir.path());
        let err = store.get_secret("default", "../escape").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidName(_)));
        let err = store.list_volumes("../..").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidName(_)));
        Ok(())
    }
}
