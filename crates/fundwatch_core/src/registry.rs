use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::bulk::BulkMatch;
use crate::cache::replace_file;
use crate::config::normalize_registrant_id;

pub(crate) const REGISTRY_HEADER: &str =
    "# Registrants tracked by `fundwatch run`. Add entries with `fundwatch registry add`.\n\n";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default, rename = "registrant")]
    registrants: Vec<RegistryEntry>,
}

/// Registrants the driver works through. Loaded once, rewritten atomically on change.
#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
    entries: Vec<RegistryEntry>,
}

impl Registry {
    /// Missing file is an empty registry.
    pub fn load(path: &Path) -> Result<Self> {
        let entries = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let parsed: RegistryFile = toml::from_str(&content)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            parsed.registrants
        } else {
            Vec::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    pub fn contains(&self, registrant_id: &str) -> bool {
        let id = normalize_registrant_id(registrant_id);
        self.entries.iter().any(|entry| entry.id == id)
    }

    pub fn get(&self, registrant_id: &str) -> Option<&RegistryEntry> {
        let id = normalize_registrant_id(registrant_id);
        self.entries.iter().find(|entry| entry.id == id)
    }

    /// Returns `false` without touching the file when the id is already present.
    pub fn add_entry(&mut self, registrant_id: &str, name: &str) -> Result<bool> {
        if !self.push(registrant_id, name)? {
            return Ok(false);
        }
        self.persist()?;
        Ok(true)
    }

    /// Add every bulk-scan discovery not already present. One rewrite at most.
    pub fn import_matches(&mut self, matches: &[BulkMatch]) -> Result<usize> {
        let mut added = 0usize;
        for found in matches {
            if self.push(&found.registrant_id, &found.name)? {
                added += 1;
            }
        }
        if added > 0 {
            self.persist()?;
            info!(added, total = self.entries.len(), "imported registrants");
        }
        Ok(added)
    }

    fn push(&mut self, registrant_id: &str, name: &str) -> Result<bool> {
        let id = normalize_registrant_id(registrant_id);
        if id.is_empty() || !id.chars().all(|ch| ch.is_ascii_digit()) {
            bail!("registrant id must be numeric, got {registrant_id:?}");
        }
        if self.entries.iter().any(|entry| entry.id == id) {
            return Ok(false);
        }
        self.entries.push(RegistryEntry {
            id,
            name: name.trim().to_string(),
        });
        Ok(true)
    }

    fn persist(&self) -> Result<()> {
        let body = toml::to_string_pretty(&RegistryFile {
            registrants: self.entries.clone(),
        })
        .context("failed to serialize registry")?;
        write_atomic(&self.path, format!("{REGISTRY_HEADER}{body}").as_bytes())
    }
}

/// Write to a sibling temp file, then rename over the target.
pub(crate) fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    replace_file(path, content).with_context(|| format!("failed to write {}", path.display()))
}
