//! Shared registry directory of installed plugins.
//!
//! One JSON file per plugin keeps writers independent: the registrar writes
//! each record exactly once and the supervisor only ever reads.

use crate::plugins::package::PluginRecord;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct PluginRegistry {
    dir: PathBuf,
}

impl PluginRegistry {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create registry dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    pub fn store(&self, record: &PluginRecord) -> Result<PathBuf> {
        let path = self.record_path(&record.name);
        let body = serde_json::to_string_pretty(record)
            .with_context(|| format!("failed to serialize record for plugin {}", record.name))?;
        fs::write(&path, body)
            .with_context(|| format!("failed to write plugin record {}", path.display()))?;
        Ok(path)
    }

    pub fn load(&self, name: &str) -> Result<PluginRecord> {
        let path = self.record_path(name);
        let body = fs::read_to_string(&path)
            .with_context(|| format!("failed to read plugin record {}", path.display()))?;
        serde_json::from_str(&body)
            .with_context(|| format!("failed to parse plugin record {}", path.display()))
    }

    /// All records, sorted by plugin name for deterministic launch order.
    pub fn load_all(&self) -> Result<Vec<PluginRecord>> {
        let mut records = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list registry dir {}", self.dir.display()))?;
        for entry in entries {
            let entry = entry.context("failed to read registry dir entry")?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let body = fs::read_to_string(&path)
                .with_context(|| format!("failed to read plugin record {}", path.display()))?;
            let record: PluginRecord = serde_json::from_str(&body)
                .with_context(|| format!("failed to parse plugin record {}", path.display()))?;
            records.push(record);
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }
}
