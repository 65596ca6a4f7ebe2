//! Volume records and the rules that bind an attested machine to them.
//!
//! A [`VolumeRecord`] is declared by operators in the record store. The broker
//! never mutates one; it only reads a point in time listing and runs
//! [`find_volume_for`] against it for every request.

use crate::identity::HardwareIdentity;
use serde::{Deserialize, Serialize};

/// Secret key used when a partition rule does not name one.
pub const DEFAULT_SECRET_PATH: &str = "passphrase";

/// One partition on the requesting machine, as reported by the client.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionDescriptor {
    #[serde(default)]
    pub label: String,
    /// Kernel device name, e.g. `sda2`
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub uuid: String,
}

impl PartitionDescriptor {
    pub fn is_empty(&self) -> bool {
        self.label.is_empty() && self.name.is_empty() && self.uuid.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeRecord {
    pub name: String,
    #[serde(rename = "tpmHash")]
    pub hardware_hash: String,
    #[serde(default)]
    pub quarantined: bool,
    #[serde(default)]
    pub partitions: Vec<PartitionRule>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionRule {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_path: Option<String>,
}

impl PartitionRule {
    /// True if any non-empty field of `descriptor` equals the same field of
    /// this rule.
    pub fn matches(&self, descriptor: &PartitionDescriptor) -> bool {
        let device_name = !descriptor.name.is_empty() && self.device_name == descriptor.name;
        let uuid = !descriptor.uuid.is_empty() && self.uuid == descriptor.uuid;
        let label = !descriptor.label.is_empty() && self.label == descriptor.label;
        device_name || uuid || label
    }
}

/// The outcome of matching a request against the declared volumes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchResult {
    pub quarantined: bool,
    pub secret_name: Option<String>,
    pub secret_path: Option<String>,
    pub volume_name: String,
    pub partition_label: String,
}

/// Where the passphrase for a matched partition lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretRef {
    pub name: String,
    pub path: String,
}

impl MatchResult {
    /// Resolves the secret location, falling back to
    /// `<volume>-<label>` / `passphrase`. Both parts are normalized into
    /// valid store object names.
    pub fn secret_ref(&self) -> SecretRef {
        let name = match self.secret_name.as_deref().filter(|n| !n.is_empty()) {
            Some(name) => name.to_owned(),
            None => format!("{}-{}", self.volume_name, self.partition_label),
        };
        let path = self
            .secret_path
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_SECRET_PATH);
        SecretRef {
            name: store_name(&name),
            path: store_name(path),
        }
    }
}

fn store_name(s: &str) -> String {
    s.replace('_', "-").to_lowercase()
}

/// First match wins: records in listing order, then rules in declaration
/// order. No scoring between fields.
pub fn find_volume_for(
    identity: &HardwareIdentity,
    descriptor: &PartitionDescriptor,
    records: &[VolumeRecord],
) -> Option<MatchResult> {
    records
        .iter()
        .filter(|record| record.hardware_hash == identity.as_str())
        .find_map(|record| {
            record
                .partitions
                .iter()
                .find(|rule| rule.matches(descriptor))
                .map(|rule| {
                    tracing::debug!(
                        volume = %record.name,
                        label = %rule.label,
                        "matched volume"
                    );
                    MatchResult {
                        quarantined: record.quarantined,
                        secret_name: rule.secret_name.clone(),
                        secret_path: rule.secret_path.clone(),
                        volume_name: record.name.clone(),
                        partition_label: rule.label.clone(),
                    }
                })
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(label: &str, device_name: &str, uuid: &str) -> PartitionRule {
        PartitionRule {
            label: label.into(),
            device_name: device_name.into(),
            uuid: uuid.into(),
            ..Default::default()
        }
    }

    fn record(name: &str, hash: &str, partitions: Vec<PartitionRule>) -> VolumeRecord {
        VolumeRecord {
            name: name.into(),
            hardware_hash: hash.into(),
            quarantined: false,
            partitions,
        }
    }

    fn by_label(label: &str) -> PartitionDescriptor {
        PartitionDescriptor {
            label: label.into(),
            ..Default::default()
        }
    }

    #[test]
    fn matches_on_any_single_field() {
        let records = vec![record("vol1", "H1", vec![rule("ROOT", "sda2", "u-1")])];
        let id = HardwareIdentity::from("H1");

        for descriptor in [
            by_label("ROOT"),
            PartitionDescriptor {
                name: "sda2".into(),
                ..Default::default()
            },
            PartitionDescriptor {
                uuid: "u-1".into(),
                ..Default::default()
            },
            PartitionDescriptor {
                label: "OTHER".into(),
                name: "nope".into(),
                uuid: "u-1".into(),
            },
        ] {
            let found = find_volume_for(&id, &descriptor, &records);
            assert_eq!(found.map(|m| m.partition_label), Some("ROOT".into()));
        }
    }

    #[test]
    fn empty_fields_never_match() {
        let records = vec![record("vol1", "H1", vec![rule("", "", "")])];
        let id = HardwareIdentity::from("H1");
        assert!(find_volume_for(&id, &PartitionDescriptor::default(), &records).is_none());
        assert!(find_volume_for(&id, &by_label("ROOT"), &records).is_none());
    }

    #[test]
    fn unknown_identity_is_absent() {
        let records = vec![record("vol1", "H1", vec![rule("ROOT", "", "")])];
        let found = find_volume_for(&HardwareIdentity::from("H2"), &by_label("ROOT"), &records);
        assert!(found.is_none());
    }

    #[test]
    fn earlier_rule_wins() {
        let mut first = rule("ROOT", "", "");
        first.secret_name = Some("first".into());
        let mut second = rule("", "sda2", "");
        second.secret_name = Some("second".into());
        let records = vec![record("vol1", "H1", vec![first, second])];
        let descriptor = PartitionDescriptor {
            label: "ROOT".into(),
            name: "sda2".into(),
            ..Default::default()
        };

        let found = find_volume_for(&HardwareIdentity::from("H1"), &descriptor, &records);
        assert_eq!(found.and_then(|m| m.secret_name), Some("first".into()));
    }

    #[test]
    fn earlier_record_wins() {
        let mut quarantined = record("old", "H1", vec![rule("ROOT", "", "")]);
        quarantined.quarantined = true;
        let records = vec![quarantined, record("new", "H1", vec![rule("ROOT", "", "")])];

        let found = find_volume_for(&HardwareIdentity::from("H1"), &by_label("ROOT"), &records)
            .expect("match");
        assert_eq!(found.volume_name, "old");
        assert!(found.quarantined);
    }

    #[test]
    fn skips_records_of_other_machines() {
        let records = vec![
            record("theirs", "H2", vec![rule("ROOT", "", "")]),
            record("ours", "H1", vec![rule("DATA", "", ""), rule("ROOT", "", "")]),
        ];
        let found = find_volume_for(&HardwareIdentity::from("H1"), &by_label("ROOT"), &records)
            .expect("match");
        assert_eq!(found.volume_name, "ours");
        assert_eq!(found.partition_label, "ROOT");
    }

    #[test]
    fn default_secret_naming() {
        let m = MatchResult {
            quarantined: false,
            secret_name: None,
            secret_path: None,
            volume_name: "vol1".into(),
            partition_label: "LUKS_ROOT".into(),
        };
        assert_eq!(
            m.secret_ref(),
            SecretRef {
                name: "vol1-luks-root".into(),
                path: "passphrase".into(),
            }
        );
    }

    #[test]
    fn explicit_secret_is_normalized() {
        let m = MatchResult {
            quarantined: false,
            secret_name: Some("Shared_Secret".into()),
            secret_path: Some("Key_One".into()),
            volume_name: "vol1".into(),
            partition_label: "ROOT".into(),
        };
        let secret = m.secret_ref();
        assert_eq!(secret.name, "shared-secret");
        assert_eq!(secret.path, "key-one");
    }

    #[test]
    fn parses_declared_yaml() -> eyre::Result<()> {
        let yaml = r#"
name: vol1
tpmHash: H1
quarantined: true
partitions:
  - label: ROOT
    secretName: root-pass
  - uuid: 1234-abcd
"#;
        let record: VolumeRecord = serde_yaml::from_str(yaml)?;
        assert!(record.quarantined);
        assert_eq!(record.partitions.len(), 2);
        assert_eq!(record.partitions[0].secret_name.as_deref(), Some("root-pass"));
        assert_eq!(record.partitions[1].uuid, "1234-abcd");
        assert_eq!(record.partitions[1].label, "");
        Ok(())
    }
}
