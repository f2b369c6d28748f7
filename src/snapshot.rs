//! Genome snapshots: atomic capture and restore of persisted state.
//!
//! A snapshot is a named directory under `.sg/snapshots/` holding a
//! point-in-time copy of the registry, phenotype, fusion tracks, and
//! regression history, plus a `meta.json` record.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::registry::unix_now;

const STATE_FILES: &[&str] = &["phenotype.toml", "fusion_tracker.json"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub name: String,
    pub timestamp: f64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub allele_count: usize,
    #[serde(default)]
    pub loci_count: usize,
}

/// Manages snapshots for one project root.
#[derive(Debug)]
pub struct SnapshotManager {
    root: PathBuf,
    snapshots_dir: PathBuf,
}

impl SnapshotManager {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        let root = project_root.into();
        let snapshots_dir = root.join(".sg").join("snapshots");
        Self {
            root,
            snapshots_dir,
        }
    }

    fn snapshot_dir(&self, name: &str) -> PathBuf {
        self.snapshots_dir.join(name)
    }

    /// Capture the current genome state under a new name. A duplicate
    /// name is a snapshot error.
    pub fn create(&self, name: Option<&str>, description: &str) -> Result<SnapshotMeta> {
        let name = match name {
            Some(name) => name.to_string(),
            None => format!("snapshot-{}", unix_now() as i64),
        };
        let snap_dir = self.snapshot_dir(&name);
        if snap_dir.exists() {
            return Err(Error::Snapshot(format!("snapshot '{name}' already exists")));
        }
        fs::create_dir_all(&snap_dir)?;

        let registry_src = self.root.join(".sg").join("registry");
        if registry_src.exists() {
            copy_dir(&registry_src, &snap_dir.join("registry"))?;
        }
        for filename in STATE_FILES {
            let src = self.root.join(filename);
            if src.exists() {
                fs::copy(&src, snap_dir.join(filename))?;
            }
        }
        let regression_src = self.root.join(".sg").join("regression.json");
        if regression_src.exists() {
            fs::copy(&regression_src, snap_dir.join("regression.json"))?;
        }

        let (allele_count, loci_count) = index_counts(&snap_dir.join("registry").join("registry.json"));
        let meta = SnapshotMeta {
            name: name.clone(),
            timestamp: unix_now(),
            description: description.to_string(),
            allele_count,
            loci_count,
        };
        fs::write(
            snap_dir.join("meta.json"),
            serde_json::to_string_pretty(&meta)?,
        )?;
        Ok(meta)
    }

    /// Restore genome state from a named snapshot, replacing the live
    /// registry directory and state files.
    pub fn restore(&self, name: &str) -> Result<()> {
        let snap_dir = self.snapshot_dir(name);
        if !snap_dir.exists() {
            return Err(Error::Snapshot(format!("snapshot '{name}' does not exist")));
        }

        let registry_snap = snap_dir.join("registry");
        let registry_dest = self.root.join(".sg").join("registry");
        if registry_snap.exists() {
            if registry_dest.exists() {
                fs::remove_dir_all(&registry_dest)?;
            }
            copy_dir(&registry_snap, &registry_dest)?;
        }

        for filename in STATE_FILES {
            let snap_file = snap_dir.join(filename);
            if snap_file.exists() {
                fs::copy(&snap_file, self.root.join(filename))?;
            }
        }
        let regression_snap = snap_dir.join("regression.json");
        if regression_snap.exists() {
            let dest_dir = self.root.join(".sg");
            fs::create_dir_all(&dest_dir)?;
            fs::copy(&regression_snap, dest_dir.join("regression.json"))?;
        }
        Ok(())
    }

    /// All snapshots, newest first.
    pub fn list(&self) -> Result<Vec<SnapshotMeta>> {
        if !self.snapshots_dir.exists() {
            return Ok(Vec::new());
        }
        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&self.snapshots_dir)? {
            let meta_path = entry?.path().join("meta.json");
            if meta_path.exists() {
                let meta: SnapshotMeta = serde_json::from_str(&fs::read_to_string(meta_path)?)?;
                snapshots.push(meta);
            }
        }
        snapshots.sort_by(|a, b| {
            b.timestamp
                .partial_cmp(&a.timestamp)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(snapshots)
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        let snap_dir = self.snapshot_dir(name);
        if !snap_dir.exists() {
            return Err(Error::Snapshot(format!("snapshot '{name}' does not exist")));
        }
        fs::remove_dir_all(snap_dir)?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Option<SnapshotMeta>> {
        let meta_path = self.snapshot_dir(name).join("meta.json");
        if !meta_path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&fs::read_to_string(meta_path)?)?))
    }
}

fn copy_dir(src: &Path, dest: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(src) {
        let entry = entry.map_err(|e| Error::Snapshot(format!("walk failed: {e}")))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::Snapshot(format!("bad snapshot path: {e}")))?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn index_counts(index_path: &Path) -> (usize, usize) {
    let Ok(text) = fs::read_to_string(index_path) else {
        return (0, 0);
    };
    let Ok(index) = serde_json::from_str::<serde_json::Value>(&text) else {
        return (0, 0);
    };
    let Some(map) = index.as_object() else {
        return (0, 0);
    };
    let mut loci: Vec<&str> = map
        .values()
        .filter_map(|record| record.get("locus").and_then(serde_json::Value::as_str))
        .collect();
    loci.sort_unstable();
    loci.dedup();
    (map.len(), loci.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    const SOURCE: &str = "use json;\nfn execute(input) { return json::dump({ \"success\": true }); }";

    fn seed_project(root: &Path) -> String {
        let mut registry = Registry::open(root.join(".sg").join("registry")).unwrap();
        let sha = registry.register(SOURCE, "bridge_create", 0, None).unwrap();
        registry.save_index().unwrap();
        fs::write(root.join("phenotype.toml"), "[locus.bridge_create]\n").unwrap();
        sha
    }

    #[test]
    fn create_captures_counts() {
        let dir = tempfile::tempdir().unwrap();
        seed_project(dir.path());
        let manager = SnapshotManager::new(dir.path());
        let meta = manager.create(Some("baseline"), "before rollout").unwrap();
        assert_eq!(meta.name, "baseline");
        assert_eq!(meta.allele_count, 1);
        assert_eq!(meta.loci_count, 1);
    }

    #[test]
    fn duplicate_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        seed_project(dir.path());
        let manager = SnapshotManager::new(dir.path());
        manager.create(Some("baseline"), "").unwrap();
        assert!(matches!(
            manager.create(Some("baseline"), ""),
            Err(Error::Snapshot(_))
        ));
    }

    #[test]
    fn restore_round_trips_registry_state() {
        let dir = tempfile::tempdir().unwrap();
        let sha = seed_project(dir.path());
        let manager = SnapshotManager::new(dir.path());
        manager.create(Some("baseline"), "").unwrap();

        // Mutate live state after the snapshot.
        let mut registry = Registry::open(dir.path().join(".sg").join("registry")).unwrap();
        registry.get_mut(&sha).unwrap().successful_invocations = 99;
        registry
            .register("fn execute(input) { return input; }", "bridge_stp", 0, None)
            .unwrap();
        registry.save_index().unwrap();

        manager.restore("baseline").unwrap();
        let restored = Registry::open(dir.path().join(".sg").join("registry")).unwrap();
        assert_eq!(restored.allele_count(), 1);
        assert_eq!(restored.get(&sha).unwrap().successful_invocations, 0);
        assert_eq!(restored.load_source(&sha).unwrap(), SOURCE);
    }

    #[test]
    fn restore_missing_snapshot_fails() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SnapshotManager::new(dir.path());
        assert!(matches!(manager.restore("ghost"), Err(Error::Snapshot(_))));
    }

    #[test]
    fn list_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        seed_project(dir.path());
        let manager = SnapshotManager::new(dir.path());
        manager.create(Some("first"), "").unwrap();
        manager.create(Some("second"), "").unwrap();

        let names: Vec<String> = manager.list().unwrap().into_iter().map(|m| m.name).collect();
        assert_eq!(names.len(), 2);

        manager.delete("first").unwrap();
        assert_eq!(manager.list().unwrap().len(), 1);
        assert!(manager.get("first").unwrap().is_none());
        assert!(manager.get("second").unwrap().is_some());
    }
}
