//! Cluster bootstrap configuration and the persisted per-node deployment
//! record (spec §6 "External interfaces").

use crate::ids::{Fid, ObjectId, Role, WorkerId};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Errors reading or validating a [`ClusterManifest`] or
/// [`DeploymentRecord`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The manifest file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The manifest was not valid YAML for the expected shape.
    #[error("invalid manifest: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The manifest failed a structural check beyond what serde enforces.
    #[error("invalid configuration: {field} - {reason}")]
    Validation {
        /// The offending field.
        field: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// One bootstrap ring: a named list of peer addresses a node dials on
/// startup to discover the rest of the cluster (spec §6 "bootstrap
/// rings").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BootstrapRing {
    /// A human-readable label for this ring.
    pub name: String,
    /// Path to the file listing the ring's member addresses, one per
    /// line.
    pub file: String,
    /// Whether members may only be read, never added to, at runtime.
    /// Defaults to `true` (spec §6: "without a file the kernel uses a
    /// default shape with `readonly` defaulting to true").
    #[serde(default = "default_readonly")]
    pub readonly: bool,
}

fn default_readonly() -> bool {
    true
}

/// The YAML-deserialized cluster bootstrap manifest (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ClusterManifest {
    /// The bootstrap rings this node joins on startup.
    #[serde(default)]
    pub bootstrap_rings: Vec<BootstrapRing>,
}

impl ClusterManifest {
    /// The manifest used when no `--config` file is supplied: a single
    /// empty set of bootstrap rings.
    #[must_use]
    pub fn default_manifest() -> Self {
        Self { bootstrap_rings: Vec::new() }
    }

    /// Loads and validates a manifest from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if it is not valid YAML, or
    /// [`ConfigError::Validation`] if a ring names an empty `file` path.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let manifest: Self = serde_yaml::from_str(&raw)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Saves the manifest to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if serialization fails, or
    /// [`ConfigError::Io`] if the file cannot be written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Checks that every ring names a non-empty file path.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] on the first ring with an
    /// empty `name` or `file`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for ring in &self.bootstrap_rings {
            if ring.name.trim().is_empty() {
                return Err(ConfigError::Validation {
                    field: "bootstrap_rings[].name".to_string(),
                    reason: "must not be empty".to_string(),
                });
            }
            if ring.file.trim().is_empty() {
                return Err(ConfigError::Validation {
                    field: "bootstrap_rings[].file".to_string(),
                    reason: "must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// A persisted agent deployment record (spec §6): `{ id, role, worker,
/// fid? }`. The `$master` pseudo-record always has `worker: 0` and no
/// `fid`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentRecord {
    /// The deployed agent's object id.
    pub id: ObjectId,
    /// The role this record deploys.
    pub role: Role,
    /// The worker place hosting this deployment.
    pub worker: WorkerId,
    /// The frame id, once the agent has actually started; absent for
    /// the `$master` pseudo-record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fid: Option<Fid>,
}

impl DeploymentRecord {
    /// Builds the `$master` pseudo-record: worker 0, no fid.
    #[must_use]
    pub fn master(id: ObjectId) -> Self {
        Self {
            id,
            role: Role::master(),
            worker: WorkerId::new(0),
            fid: None,
        }
    }

    /// Builds a record for an agent once it has a concrete frame.
    #[must_use]
    pub fn deployed(id: ObjectId, role: Role, worker: WorkerId, fid: Fid) -> Self {
        Self {
            id,
            role,
            worker,
            fid: Some(fid),
        }
    }
}

/// Persists and reloads a node's [`DeploymentRecord`] set as JSON, the
/// kernel's durable record of "what was running here" across a restart.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeploymentTable {
    /// Every record currently persisted for this node.
    pub records: Vec<DeploymentRecord>,
}

impl DeploymentTable {
    /// Loads a deployment table from a JSON file, returning an empty
    /// table if the file does not exist (a node's first boot).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] for any I/O failure other than
    /// not-found, or a deserialization error wrapped as
    /// [`ConfigError::Validation`].
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| ConfigError::Validation {
                field: "deployment table".to_string(),
                reason: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    /// Saves the deployment table to a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(&self.records).map_err(|e| ConfigError::Validation {
            field: "deployment table".to_string(),
            reason: e.to_string(),
        })?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Adds or replaces the record for `(id, role, worker)`.
    pub fn upsert(&mut self, record: DeploymentRecord) {
        self.records
            .retain(|r| !(r.id == record.id && r.role == record.role && r.worker == record.worker));
        self.records.push(record);
    }

    /// Removes the record matching `fid`, if any.
    pub fn remove_by_fid(&mut self, fid: Fid) {
        self.records.retain(|r| r.fid != Some(fid));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn manifest_round_trips_through_yaml_file() {
        let manifest = ClusterManifest {
            bootstrap_rings: vec![BootstrapRing {
                name: "primary".to_string(),
                file: "rings/primary.txt".to_string(),
                readonly: true,
            }],
        };
        let temp = NamedTempFile::new().unwrap();
        manifest.save_to_file(temp.path()).unwrap();
        let loaded = ClusterManifest::load_from_file(temp.path()).unwrap();
        assert_eq!(manifest, loaded);
    }

    #[test]
    fn manifest_without_file_defaults_to_empty_rings() {
        let manifest = ClusterManifest::default_manifest();
        assert!(manifest.bootstrap_rings.is_empty());
    }

    #[test]
    fn ring_readonly_defaults_true_when_omitted() {
        let yaml = "bootstrap_rings:\n  - name: primary\n    file: rings/primary.txt\n";
        let manifest: ClusterManifest = serde_yaml::from_str(yaml).unwrap();
        assert!(manifest.bootstrap_rings[0].readonly);
    }

    #[test]
    fn manifest_rejects_ring_with_empty_file() {
        let manifest = ClusterManifest {
            bootstrap_rings: vec![BootstrapRing {
                name: "primary".to_string(),
                file: String::new(),
                readonly: true,
            }],
        };
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn master_pseudo_record_has_no_fid_and_worker_zero() {
        let record = DeploymentRecord::master(ObjectId::new(1));
        assert_eq!(record.worker, WorkerId::new(0));
        assert!(record.fid.is_none());
        assert_eq!(record.role, Role::master());
    }

    #[test]
    fn deployment_table_round_trips_and_upserts() {
        let mut table = DeploymentTable::default();
        let fid = Fid::generate();
        table.upsert(DeploymentRecord::deployed(ObjectId::new(1), Role::agent(), WorkerId::new(1), fid));
        assert_eq!(table.records.len(), 1);

        table.upsert(DeploymentRecord::deployed(ObjectId::new(1), Role::agent(), WorkerId::new(1), fid));
        assert_eq!(table.records.len(), 1, "re-upserting the same key replaces rather than duplicates");

        let temp = NamedTempFile::new().unwrap();
        table.save_to_file(temp.path()).unwrap();
        let loaded = DeploymentTable::load_from_file(temp.path()).unwrap();
        assert_eq!(loaded.records.len(), 1);

        let mut loaded = loaded;
        loaded.remove_by_fid(fid);
        assert!(loaded.records.is_empty());
    }

    #[test]
    fn deployment_table_missing_file_loads_empty() {
        let table = DeploymentTable::load_from_file("/nonexistent/path/deployments.json").unwrap();
        assert!(table.records.is_empty());
    }
}
