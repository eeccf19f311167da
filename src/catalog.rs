//! Seed and record data model, slugging, seed loading and dataset output.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::PipelineError;

/// Taxonomic display group of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnimalGroup {
    Mammals,
    Fish,
    Amphibians,
    Reptiles,
    Birds,
}

/// Curated input entity. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Seed {
    pub group: AnimalGroup,
    pub common_name: String,
    pub scientific_name: String,
    #[serde(default, deserialize_with = "non_blank")]
    pub size: Option<String>,
    #[serde(default, deserialize_with = "non_blank")]
    pub life_expectancy: Option<String>,
    #[serde(default, deserialize_with = "non_blank")]
    pub habitat: Option<String>,
    #[serde(default, deserialize_with = "non_blank")]
    pub fun_fact: Option<String>,
    #[serde(default, deserialize_with = "non_blank")]
    pub image_url: Option<String>,
    #[serde(default, rename = "imageSearch", deserialize_with = "search_terms")]
    pub image_search_terms: Vec<String>,
}

/// Fully enriched output entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnimalRecord {
    pub id: String,
    pub group: AnimalGroup,
    pub common_name: String,
    pub scientific_name: String,
    pub size: String,
    pub life_expectancy: String,
    pub habitat: String,
    pub fun_fact: String,
    pub image: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn non_blank<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|text| !text.trim().is_empty()))
}

fn search_terms<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let terms = match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(term)) => vec![term],
        Some(OneOrMany::Many(terms)) => terms,
    };
    Ok(terms
        .into_iter()
        .filter(|term| !term.trim().is_empty())
        .collect())
}

impl Seed {
    pub fn id(&self) -> String {
        slugify(&self.scientific_name)
    }

    /// Distinct image search terms: scientific name, common name, then the
    /// seed's extra terms, de-duplicated case-insensitively.
    pub fn search_terms(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut terms = Vec::new();
        for term in [&self.scientific_name, &self.common_name]
            .into_iter()
            .chain(self.image_search_terms.iter())
        {
            let trimmed = term.trim();
            if trimmed.is_empty() {
                continue;
            }
            if seen.insert(trimmed.to_lowercase()) {
                terms.push(trimmed.to_string());
            }
        }
        terms
    }
}

/// Lowercases `name` and collapses every run of non-alphanumeric characters
/// into one underscore, trimming leading/trailing underscores. Idempotent.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_separator = false;
    for ch in name.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            if pending_separator && !slug.is_empty() {
                slug.push('_');
            }
            pending_separator = false;
            slug.push(ch);
        } else {
            pending_separator = true;
        }
    }
    slug
}

pub fn parse_seeds(json: &str) -> Result<Vec<Seed>, PipelineError> {
    let seeds: Vec<Seed> =
        serde_json::from_str(json).map_err(|error| PipelineError::SeedFormat(error.to_string()))?;
    for seed in &seeds {
        if seed.scientific_name.trim().is_empty() || seed.common_name.trim().is_empty() {
            return Err(PipelineError::SeedFormat(format!(
                "entry '{}' / '{}' has a blank name",
                seed.scientific_name, seed.common_name
            )));
        }
    }
    Ok(seeds)
}

pub fn load_seeds(path: &Path) -> Result<Vec<Seed>, PipelineError> {
    let content = fs::read_to_string(path).map_err(|error| PipelineError::io(path, error))?;
    parse_seeds(&content)
}

/// Writes the dataset as a pretty-printed JSON array, creating parent dirs.
pub fn write_records(records: &[AnimalRecord], path: &Path) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|error| PipelineError::io(parent, error))?;
    }
    let payload = serde_json::to_string_pretty(records)
        .map_err(|error| PipelineError::io(path, std::io::Error::from(error)))?;
    fs::write(path, payload).map_err(|error| PipelineError::io(path, error))
}
