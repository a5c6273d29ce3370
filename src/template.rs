//! Placeholder-based configuration rendering.
//!
//! Templates carry literal marker strings (for example `@@DATABASE_PORT@@`)
//! that get replaced verbatim with values discovered at run time. The set of
//! recognized placeholders is a closed enum so a typo in a substitution table
//! is a compile error, not a silent no-op at render time.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// The closed set of values a template may reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placeholder {
    DatabaseHost,
    DatabasePort,
    CachePort,
    ProxyPort,
    ServerCert,
    ConfigDir,
    RegistryDir,
    CoordinatorAddress,
}

impl Placeholder {
    /// Literal marker string replaced verbatim wherever it occurs.
    pub fn marker(&self) -> &'static str {
        match self {
            Placeholder::DatabaseHost => "@@DATABASE_HOST@@",
            Placeholder::DatabasePort => "@@DATABASE_PORT@@",
            Placeholder::CachePort => "@@CACHE_PORT@@",
            Placeholder::ProxyPort => "@@PROXY_PORT@@",
            Placeholder::ServerCert => "@@SERVER_CERT@@",
            Placeholder::ConfigDir => "@@CONFIG_DIR@@",
            Placeholder::RegistryDir => "@@REGISTRY_DIR@@",
            Placeholder::CoordinatorAddress => "@@COORDINATOR_ADDRESS@@",
        }
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.marker())
    }
}

/// Typed substitution table handed to [`render`].
#[derive(Debug, Clone, Default)]
pub struct Substitutions {
    values: BTreeMap<Placeholder, String>,
}

impl Substitutions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, placeholder: Placeholder, value: impl Into<String>) -> &mut Self {
        self.values.insert(placeholder, value.into());
        self
    }

    pub fn get(&self, placeholder: Placeholder) -> Option<&str> {
        self.values.get(&placeholder).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Placeholder, &str)> {
        self.values.iter().map(|(key, value)| (*key, value.as_str()))
    }
}

/// Controls how [`render`] treats a substitution whose marker never occurs in
/// the template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    /// Every entry in the substitution table must match at least once.
    Strict,
    /// Unmatched entries (and unknown markers in the file) are left untouched.
    Permissive,
}

/// Raised when a strict render references placeholders the template lacks.
#[derive(Debug)]
pub struct TemplateError {
    template: PathBuf,
    missing: Vec<Placeholder>,
}

impl TemplateError {
    pub fn template(&self) -> &Path {
        &self.template
    }

    pub fn missing(&self) -> &[Placeholder] {
        &self.missing
    }
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let markers: Vec<&str> = self.missing.iter().map(|p| p.marker()).collect();
        write!(
            f,
            "template {} does not contain required markers: {}",
            self.template.display(),
            markers.join(", ")
        )
    }
}

impl std::error::Error for TemplateError {}

/// Renders `template` into `target`, replacing every occurrence of each
/// substitution's marker. Rendering is idempotent: the same inputs always
/// produce byte-identical output, and nothing is touched beyond the target
/// file.
pub fn render(
    template: &Path,
    target: &Path,
    substitutions: &Substitutions,
    mode: RenderMode,
) -> Result<()> {
    let mut contents = fs::read_to_string(template)
        .with_context(|| format!("failed to read template {}", template.display()))?;

    let mut missing = Vec::new();
    for (placeholder, value) in substitutions.iter() {
        let marker = placeholder.marker();
        if contents.contains(marker) {
            contents = contents.replace(marker, value);
        } else if mode == RenderMode::Strict {
            missing.push(placeholder);
        }
    }

    if !missing.is_empty() {
        return Err(TemplateError {
            template: template.to_path_buf(),
            missing,
        }
        .into());
    }

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config dir {}", parent.display()))?;
    }
    fs::write(target, contents)
        .with_context(|| format!("failed to write rendered config {}", target.display()))?;

    Ok(())
}
