//! Liveness and artifact-integrity probes.
//!
//! Liveness is re-checked every cycle against the same snapshot the
//! controller reconciled with. Artifact integrity hashes each configured file
//! and keeps one `<file_name>.<path digest>.bak` per file, rewritten only when
//! the content changed. A file that fails to parse never replaces a good backup.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::models::{HealthCheck, HealthClass, Lifecycle, ProcessConfig};
use crate::services::controller::ProcessController;

/// Result of probing one process.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthRecord {
    pub id: String,
    pub class: HealthClass,
    /// Managed process vanished or stopped matching its rule: crash path.
    pub liveness_failed: bool,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactOutcome {
    Unchanged,
    BackedUp(PathBuf),
}

#[derive(Debug, Default)]
pub struct HealthMonitor {
    /// backup 路径 → 内容的 SHA-256
    backups: HashMap<PathBuf, String>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probe every process that has something to report.
    ///
    /// Managed processes that are stopped or never started and observed
    /// processes that are not being watched produce no record.
    pub fn probe_all(&mut self, controller: &ProcessController) -> Vec<HealthRecord> {
        let snapshot = controller.snapshot();
        let mut records = Vec::new();

        for cfg in controller.registry() {
            let Some(state) = controller.state(&cfg.id) else {
                continue;
            };

            let live = state
                .pid
                .map_or(false, |pid| snapshot.verify(pid, &cfg.match_rule));

            let (mut class, liveness_failed) = if cfg.is_managed() {
                match state.lifecycle {
                    Lifecycle::Running if live => (HealthClass::Healthy, false),
                    Lifecycle::Running => (HealthClass::Failed, true),
                    Lifecycle::Starting | Lifecycle::Stopping => (HealthClass::Degraded, false),
                    Lifecycle::Crashed | Lifecycle::GaveUp => (HealthClass::Failed, false),
                    Lifecycle::Unknown | Lifecycle::Stopped => continue,
                }
            } else {
                if !state.is_watching() {
                    continue;
                }
                if live {
                    (HealthClass::Healthy, false)
                } else {
                    (HealthClass::Degraded, false)
                }
            };

            let mut issues = Vec::new();
            if !live {
                if let Some(pid) = state.pid {
                    issues.push(format!("PID {} no longer matches {}", pid, cfg.match_rule));
                } else if !cfg.is_managed() {
                    issues.push(format!("no process matching {}", cfg.match_rule));
                }
            }

            if live {
                let artifact_issues = self.check_config(cfg);
                if !artifact_issues.is_empty() && class == HealthClass::Healthy {
                    class = HealthClass::Degraded;
                }
                issues.extend(artifact_issues);
            }

            records.push(HealthRecord {
                id: cfg.id.clone(),
                class,
                liveness_failed,
                issues,
            });
        }

        records
    }

    fn check_config(&mut self, cfg: &ProcessConfig) -> Vec<String> {
        match &cfg.health_check {
            HealthCheck::Liveness => Vec::new(),
            HealthCheck::Artifacts { files, backup_dir } => self.check_artifacts(files, backup_dir),
        }
    }

    /// Check each file and refresh its backup. Returns one issue per bad file.
    pub fn check_artifacts(&mut self, files: &[PathBuf], backup_dir: &Path) -> Vec<String> {
        let mut issues = Vec::new();
        for file in files {
            match self.check_file(file, backup_dir) {
                Ok(ArtifactOutcome::BackedUp(backup)) => {
                    log::info!("Backed up {} to {}", file.display(), backup.display());
                }
                Ok(ArtifactOutcome::Unchanged) => {}
                Err(issue) => {
                    log::warn!("Integrity check failed: {}", issue);
                    issues.push(issue);
                }
            }
        }
        issues
    }

    pub fn check_file(&mut self, file: &Path, backup_dir: &Path) -> Result<ArtifactOutcome, String> {
        let content = fs::read(file).map_err(|e| format!("cannot read {}: {}", file.display(), e))?;

        if file.extension().and_then(|e| e.to_str()) == Some("json") {
            serde_json::from_slice::<serde_json::Value>(&content)
                .map_err(|e| format!("invalid JSON in {}: {}", file.display(), e))?;
        }

        let backup = backup_path(file, backup_dir)
            .ok_or_else(|| format!("{} has no file name", file.display()))?;
        let hash = digest(&content);

        let previous = match self.backups.get(&backup) {
            Some(cached) => Some(cached.clone()),
            None => fs::read(&backup).ok().map(|bytes| digest(&bytes)),
        };

        if previous.as_deref() == Some(hash.as_str()) {
            self.backups.insert(backup, hash);
            return Ok(ArtifactOutcome::Unchanged);
        }

        if previous.is_some() {
            log::info!("{} changed since last backup", file.display());
        }

        write_atomic(&backup, &content)
            .map_err(|e| format!("cannot write backup {}: {}", backup.display(), e))?;
        self.backups.insert(backup.clone(), hash);
        Ok(ArtifactOutcome::BackedUp(backup))
    }
}

/// Backup location for `file`.
///
/// Same-named files from different directories may share a backup
/// directory, so the name carries a short digest of the source path.
pub fn backup_path(file: &Path, backup_dir: &Path) -> Option<PathBuf> {
    let file_name = file.file_name()?.to_str()?;
    let source = digest(file.to_string_lossy().as_bytes());
    Some(backup_dir.join(format!("{}.{}.bak", file_name, &source[..8])))
}

fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write to a sibling temp file then rename over the destination.
fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("bak.tmp");
    {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        f.write_all(content)?;
        let _ = f.sync_all();
    }
    fs::rename(&tmp_path, path)?;

    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}
