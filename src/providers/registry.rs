//! Provider registry - the table of descriptors keyed by provider name.

use super::{AuthMode, ProviderDescriptor};
use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

#[derive(Deserialize)]
struct DescriptorFile {
    #[serde(default)]
    providers: Vec<ProviderDescriptor>,
}

/// Immutable after construction; share it by `Arc`.
#[derive(Debug, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<ProviderDescriptor>>,
}

impl ProviderRegistry {
    /// Loads descriptors from a TOML file of `[[providers]]` tables.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read provider descriptors at {}", path.display()))?;
        Self::from_toml_str(&contents)
            .with_context(|| format!("Invalid provider descriptors in {}", path.display()))
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let file: DescriptorFile =
            toml::from_str(contents).context("Failed to parse provider descriptors")?;
        Self::from_descriptors(file.providers)
    }

    /// Validates and indexes descriptors.
    pub fn from_descriptors(descriptors: Vec<ProviderDescriptor>) -> Result<Self> {
        let mut providers = HashMap::new();

        for descriptor in descriptors {
            validate(&descriptor)?;
            let name = descriptor.name.clone();
            if providers.insert(name.clone(), Arc::new(descriptor)).is_some() {
                bail!("Duplicate provider descriptor '{}'", name);
            }
        }

        tracing::debug!(count = providers.len(), "Provider descriptors loaded");
        Ok(Self { providers })
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProviderDescriptor>> {
        self.providers.get(name).cloned()
    }

    /// All descriptors ordered by name.
    pub fn list(&self) -> Vec<Arc<ProviderDescriptor>> {
        let mut all: Vec<_> = self.providers.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

fn validate(d: &ProviderDescriptor) -> Result<()> {
    if d.name.is_empty()
        || !d
            .name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        bail!(
            "Provider name '{}' must be lowercase alphanumeric with '-' or '_'",
            d.name
        );
    }

    if d.auth_mode == AuthMode::OAuth2 && d.oauth.is_none() {
        bail!("Provider '{}' uses oauth2 but has no [oauth] table", d.name);
    }

    if d.base_url.sandbox.trim().is_empty() || d.base_url.live.trim().is_empty() {
        bail!("Provider '{}' must declare both sandbox and live base URLs", d.name);
    }

    for (op, template) in &d.operations {
        reqwest::Method::from_bytes(template.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| {
                anyhow!(
                    "Provider '{}' operation '{}' has invalid method '{}'",
                    d.name,
                    op,
                    template.method
                )
            })?;
    }

    // Non-OAuth injection points can only read fields a direct connect collects
    if d.auth_mode != AuthMode::OAuth2 {
        for injection in &d.auth {
            for field in injection.fields() {
                if !d.credential_fields.iter().any(|f| f == field) {
                    bail!(
                        "Provider '{}' injects undeclared credential field '{}'",
                        d.name,
                        field
                    );
                }
            }
        }
    }

    Ok(())
}
