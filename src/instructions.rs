use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::label::WasteCategory;

/// Text shown for labels that have no instructions.
pub const NO_INSTRUCTIONS: &str = "No instructions available.";

#[derive(Debug, Default, Serialize, Deserialize)]
struct OverridesFile {
    #[serde(default)]
    overrides: BTreeMap<String, String>,
}

/// Maps waste categories to disposal instructions, with user overrides.
///
/// Overrides are stored in a TOML file so they survive restarts.
#[derive(Debug, Clone)]
pub struct InstructionResolver {
    defaults: HashMap<WasteCategory, String>,
    overrides: HashMap<WasteCategory, String>,
    overrides_path: Option<PathBuf>,
}

impl Default for InstructionResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl InstructionResolver {
    pub fn new() -> Self {
        let defaults = WasteCategory::all()
            .iter()
            .map(|category| {
                (
                    *category,
                    format!("Instructions for {}. (Edit this content as needed.)", category),
                )
            })
            .collect();

        Self {
            defaults,
            overrides: HashMap::new(),
            overrides_path: None,
        }
    }

    /// Resolver backed by an overrides file. A missing file means no overrides yet.
    pub fn with_overrides_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut resolver = Self::new();
        if path.exists() {
            resolver.load_overrides(path)?;
        }
        resolver.overrides_path = Some(path.to_path_buf());
        Ok(resolver)
    }

    pub fn resolve(&self, category: WasteCategory) -> &str {
        self.overrides
            .get(&category)
            .or_else(|| self.defaults.get(&category))
            .map(String::as_str)
            .unwrap_or(NO_INSTRUCTIONS)
    }

    /// Resolve a raw class name; unrecognised names get the placeholder.
    pub fn resolve_name(&self, class_name: &str) -> &str {
        match class_name.parse::<WasteCategory>() {
            Ok(category) => self.resolve(category),
            Err(_) => NO_INSTRUCTIONS,
        }
    }

    /// Returns the override this one replaced, if any.
    pub fn set_override(&mut self, category: WasteCategory, text: impl Into<String>) -> Option<String> {
        self.overrides.insert(category, text.into())
    }

    pub fn clear_override(&mut self, category: WasteCategory) -> Option<String> {
        self.overrides.remove(&category)
    }

    pub fn has_override(&self, category: WasteCategory) -> bool {
        self.overrides.contains_key(&category)
    }

    pub fn load_overrides<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read instruction overrides: {}", path.display()))?;
        let file: OverridesFile = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse instruction overrides: {}", path.display()))?;

        for (name, text) in file.overrides {
            match name.parse::<WasteCategory>() {
                Ok(category) => {
                    self.overrides.insert(category, text);
                }
                Err(e) => log::warn!("Ignoring instruction override: {}", e),
            }
        }

        log::info!(
            "Loaded {} instruction override(s) from {}",
            self.overrides.len(),
            path.display()
        );
        Ok(())
    }

    /// Persist overrides to the file this resolver was created with.
    pub fn save(&self) -> Result<()> {
        match &self.overrides_path {
            Some(path) => self.save_to_file(path),
            None => Err(anyhow::anyhow!("No instruction overrides file configured")),
        }
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = OverridesFile {
            overrides: self
                .overrides
                .iter()
                .map(|(category, text)| (category.name().to_string(), text.clone()))
                .collect(),
        };
        let contents = toml::to_string_pretty(&file)
            .context("Failed to serialize instruction overrides")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write instruction overrides: {}", path.display()))?;

        log::info!("Instruction overrides saved to {}", path.display());
        Ok(())
    }
}
