//! Client side boot configuration.
//!
//! Settings live under the `keyserver` namespace of a YAML document. They
//! are read from an optional config file, then from the kernel command line,
//! where dotted keys such as `keyserver.server=http://10.0.0.1:8082` are
//! expanded into the same structure. The `KEYSERVER_URL` environment
//! variable overrides the server address last.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const CMDLINE: &str = "/proc/cmdline";
pub const CONFIG_FILE: &str = "/etc/keyserver/config.yaml";
pub const SERVER_ENV: &str = "KEYSERVER_URL";

pub const DEFAULT_SEAL_HANDLE: &str = "0x81010002";
pub const DEFAULT_TPM_DEVICE: &str = "/dev/tpmrm0";
pub const DEFAULT_PCRS: &str = "sha256:0,7";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read `{}`: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid seal handle `{0}`")]
    InvalidHandle(String),
}

pub type Result<T, E = ConfigError> = core::result::Result<T, E>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server: Option<String>,
    /// Persistent TPM handle holding the locally sealed passphrase.
    pub seal_handle: String,
    pub tpm_device: String,
    /// PCR selection the local seal is bound to, e.g. `sha256:0,7`.
    pub pcrs: String,
    #[serde(deserialize_with = "lenient")]
    pub attempts: u32,
    #[serde(deserialize_with = "lenient")]
    pub backoff_ms: u64,
    /// Submit a generated passphrase when the broker has none stored.
    #[serde(deserialize_with = "lenient")]
    pub generate_on_miss: bool,
    /// Use the locally sealed passphrase when no server is configured.
    #[serde(deserialize_with = "lenient")]
    pub offline_fallback: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: None,
            seal_handle: DEFAULT_SEAL_HANDLE.into(),
            tpm_device: DEFAULT_TPM_DEVICE.into(),
            pcrs: DEFAULT_PCRS.into(),
            attempts: 30,
            backoff_ms: 1000,
            generate_on_miss: true,
            offline_fallback: false,
        }
    }
}

impl ClientConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn seal_handle(&self) -> Result<u32> {
        let raw = self.seal_handle.trim();
        let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16),
            None => raw.parse(),
        };
        parsed.map_err(|_| ConfigError::InvalidHandle(self.seal_handle.clone()))
    }

    pub fn server(&self) -> Option<&str> {
        self.server.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Lenient<T> {
    Value(T),
    Text(String),
}

/// Accepts either a typed YAML value or its string form, since command
/// line values always arrive as strings.
fn lenient<'de, D, T>(deserializer: D) -> core::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + FromStr,
    T::Err: Display,
{
    match Lenient::<T>::deserialize(deserializer)? {
        Lenient::Value(value) => Ok(value),
        Lenient::Text(text) => text.trim().parse().map_err(de::Error::custom),
    }
}

#[derive(Deserialize, Default)]
struct Document {
    #[serde(default)]
    keyserver: ClientConfig,
}

/// Expands `a.b.c=value` tokens into nested mappings. Tokens without `=`
/// become `true` flags.
pub fn cmdline_to_yaml(cmdline: &str) -> Value {
    let mut root = Mapping::new();
    for token in split_cmdline(cmdline) {
        let (key, value) = match token.split_once('=') {
            Some((key, value)) => (key, Value::String(value.to_owned())),
            None => (token.as_str(), Value::Bool(true)),
        };
        let path: Vec<&str> = key.split('.').filter(|p| !p.is_empty()).collect();
        insert_path(&mut root, &path, value);
    }
    Value::Mapping(root)
}

fn insert_path(node: &mut Mapping, path: &[&str], value: Value) {
    match path {
        [] => {}
        [last] => {
            node.insert(Value::String((*last).to_owned()), value);
        }
        [first, rest @ ..] => {
            let key = Value::String((*first).to_owned());
            if !node.get(&key).map_or(false, Value::is_mapping) {
                node.insert(key.clone(), Value::Mapping(Mapping::new()));
            }
            if let Some(Value::Mapping(child)) = node.get_mut(&key) {
                insert_path(child, rest, value);
            }
        }
    }
}

fn split_cmdline(cmdline: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in cmdline.chars() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Recursively overlays `top` onto `base`.
fn merge(base: &mut Value, top: Value) {
    match (base, top) {
        (Value::Mapping(base), Value::Mapping(top)) => {
            for (key, value) in top {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, top) => *base = top,
    }
}

fn read(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ConfigError::Read {
            path: path.to_owned(),
            source,
        }),
    }
}

/// Where the client configuration comes from.
#[derive(Clone, Debug)]
pub struct ConfigSources {
    pub file: Option<PathBuf>,
    pub cmdline: PathBuf,
    pub server_env: String,
}

impl Default for ConfigSources {
    fn default() -> Self {
        Self {
            file: Some(CONFIG_FILE.into()),
            cmdline: CMDLINE.into(),
            server_env: SERVER_ENV.into(),
        }
    }
}

impl ConfigSources {
    pub fn load(&self) -> Result<ClientConfig> {
        let mut doc = Value::Mapping(Mapping::new());
        if let Some(raw) = self.file.as_deref().map(read).transpose()?.flatten() {
            let file: Value = serde_yaml::from_str(&raw)?;
            if !file.is_null() {
                merge(&mut doc, file);
            }
        }
        if let Some(raw) = read(&self.cmdline)? {
            merge(&mut doc, cmdline_to_yaml(&raw));
        }

        let mut config = serde_yaml::from_value::<Document>(doc)?.keyserver;

        if let Some(server) = std::env::var(&self.server_env)
            .ok()
            .filter(|s| !s.trim().is_empty())
        {
            config.server = Some(server);
        }
        Ok(config)
    }

    /// Best effort server lookup, re-read on every call so that a server
    /// published late in boot is still picked up.
    pub fn server(&self) -> Option<String> {
        match self.load() {
            Ok(config) => config.server().map(str::to_owned),
            Err(e) => {
                tracing::debug!(error = %e, "could not read client configuration");
                std::env::var(&self.server_env)
                    .ok()
                    .filter(|s| !s.trim().is_empty())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;
    use std::io::Write;

    fn sources(dir: &Path, file: Option<&str>, cmdline: &str) -> Result<ConfigSources> {
        let file = match file {
            Some(contents) => {
                let path = dir.join("config.yaml");
                std::fs::File::create(&path)?.write_all(contents.as_bytes())?;
                Some(path)
            }
            None => None,
        };
        let cmdline_path = dir.join("cmdline");
        std::fs::write(&cmdline_path, cmdline)?;
        Ok(ConfigSources {
            file,
            cmdline: cmdline_path,
            server_env: format!("KEYSERVER_TEST_{}", uuid::Uuid::new_v4().simple()),
        })
    }

    #[test]
    fn expands_dotted_cmdline() -> Result<()> {
        let doc = cmdline_to_yaml(
            "BOOT_IMAGE=/vmlinuz ro quiet keyserver.server=http://10.0.0.1:8082 keyserver.attempts=5",
        );
        let expected: Value = serde_yaml::from_str(
            r#"
BOOT_IMAGE: /vmlinuz
ro: true
quiet: true
keyserver:
  server: "http://10.0.0.1:8082"
  attempts: "5"
"#,
        )?;
        assert_eq!(doc, expected);
        Ok(())
    }

    #[test]
    fn quoted_values_keep_spaces() {
        let doc = cmdline_to_yaml(r#"keyserver.tpm_device="/dev/my tpm" rw"#);
        assert_eq!(
            doc.get("keyserver").and_then(|k| k.get("tpm_device")),
            Some(&Value::String("/dev/my tpm".into()))
        );
    }

    #[test]
    fn defaults_without_any_source() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = sources(dir.path(), None, "ro quiet")?.load()?;
        assert_eq!(config, ClientConfig::default());
        assert_eq!(config.seal_handle()?, 0x8101_0002);
        assert_eq!(config.backoff(), Duration::from_secs(1));
        assert_eq!(config.attempts, 30);
        Ok(())
    }

    #[test]
    fn cmdline_overrides_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let file = "keyserver:\n  server: http://from-file\n  attempts: 3\n  offline_fallback: true\n";
        let cmdline = "keyserver.server=http://from-cmdline keyserver.generate_on_miss=false";
        let config = sources(dir.path(), Some(file), cmdline)?.load()?;
        assert_eq!(config.server(), Some("http://from-cmdline"));
        assert_eq!(config.attempts, 3);
        assert!(config.offline_fallback);
        assert!(!config.generate_on_miss);
        Ok(())
    }

    #[test]
    fn environment_overrides_everything() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sources = sources(dir.path(), None, "keyserver.server=http://from-cmdline")?;
        std::env::set_var(&sources.server_env, "http://from-env");
        let server = sources.server();
        std::env::remove_var(&sources.server_env);
        assert_eq!(server.as_deref(), Some("http://from-env"));
        Ok(())
    }

    #[test]
    fn missing_server_is_none() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let sources = sources(dir.path(), None, "keyserver.server=")?;
        assert_eq!(sources.server(), None);
        Ok(())
    }

    #[test]
    fn rejects_bad_handle() {
        let config = ClientConfig {
            seal_handle: "0xnope".into(),
            ..Default::default()
        };
        assert!(matches!(
            config.seal_handle(),
            Err(ConfigError::InvalidHandle(_))
        ));
    }
}
