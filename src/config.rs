//! Pipeline configuration model and defaults.
//!
//! Every table is owned by the pipeline's construction context: the keyword
//! sets are plain data so alternate vocabularies can be injected from
//! `config.toml` or from tests.

use std::path::{Path, PathBuf};

use log::info;

use crate::error::PipelineError;

/// Root configuration read from `config.toml`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct PipelineConfig {
    #[serde(default)]
    /// Reference-site client behavior.
    pub source: SourceConfig,
    #[serde(default)]
    /// Input and output locations.
    pub paths: PathsConfig,
    #[serde(default)]
    /// Run-level pacing and caching.
    pub run: RunConfig,
    #[serde(default)]
    /// Keyword and phrase tables used by extraction, selection and validation.
    pub keywords: KeywordConfig,
    #[serde(default)]
    /// Acceptance gate thresholds.
    pub validator: ValidatorConfig,
}

/// Reference-site endpoints, selectors and retry policy.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct SourceConfig {
    pub base_url: String,
    pub user_agent: String,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    /// Minimum spacing between two outbound requests.
    pub min_request_interval_ms: u64,
    pub search_result_selector: String,
    pub article_paragraph_selectors: Vec<String>,
    pub image_selector_groups: Vec<String>,
    /// Path prefixes identifying entity pages, used for scoring and fallback scanning.
    pub category_prefixes: Vec<String>,
    /// Prefix that earns the +1 "entity page" bonus when scoring search results.
    pub entity_prefix: String,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct PathsConfig {
    pub seeds: PathBuf,
    pub output: PathBuf,
    pub image_dir: PathBuf,
    /// Public path prefix written into records for persisted images.
    pub asset_prefix: String,
    pub placeholder_image: String,
    /// SQLite file for the fetched-document cache. `None` uses the user cache dir.
    pub cache_db: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct RunConfig {
    pub politeness_delay_ms: u64,
    pub document_cache_ttl_hours: u64,
    pub max_variants_per_candidate: usize,
}

/// Keyword tables. All entries are matched as lowercase substrings.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct KeywordConfig {
    pub size: Vec<String>,
    pub lifespan: Vec<String>,
    pub habitat: Vec<String>,
    pub boilerplate_phrases: Vec<String>,
    pub negative_alt: Vec<String>,
    pub negative_url: Vec<String>,
    pub placeholder_url_markers: Vec<String>,
    pub resize_query_keys: Vec<String>,
    /// Labels that identify an animal subject (category classifier labels, alt text).
    pub animal_labels: Vec<String>,
    /// Nature-context words that, together with `animal_labels`, make up the positive alt set.
    pub nature_context: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub min_width: u32,
    pub min_height: u32,
    pub overlay_max_edge_px: u32,
    pub overlay_white_level: u8,
    pub overlay_black_level: u8,
    pub overlay_white_fraction: f32,
    pub overlay_black_fraction: f32,
    pub min_gray_std_dev: f32,
    pub zero_shot_min_positive: f32,
    pub zero_shot_margin: f32,
    /// Below this positive probability a zero-shot rejection cannot be overridden
    /// by the category classifier.
    pub zero_shot_floor: f32,
    pub category_top_k: usize,
}

impl KeywordConfig {
    /// Positive alt-text keywords: nature context plus every animal label.
    pub fn positive_alt(&self) -> impl Iterator<Item = &str> {
        self.nature_context
            .iter()
            .chain(self.animal_labels.iter())
            .map(String::as_str)
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.britannica.com".to_string(),
            user_agent: default_user_agent(),
            timeout_secs: 20,
            max_attempts: 3,
            retry_delay_ms: 3_000,
            min_request_interval_ms: 250,
            search_result_selector: "li.m-search-results__item a[href]".to_string(),
            article_paragraph_selectors: strings(&[
                "section.m-article__body-content p",
                "article p",
            ]),
            image_selector_groups: strings(&[
                "figure img",
                ".md-assembly img",
                ".assemblies img",
                "img",
            ]),
            category_prefixes: strings(&["/animal/", "/science/", "/plant/"]),
            entity_prefix: "/animal/".to_string(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            seeds: PathBuf::from("data/animals_source.json"),
            output: PathBuf::from("data/animals.json"),
            image_dir: PathBuf::from("public/assets/animals"),
            asset_prefix: "/assets/animals".to_string(),
            placeholder_image: "/assets/placeholder.svg".to_string(),
            cache_db: None,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            politeness_delay_ms: 500,
            document_cache_ttl_hours: 7 * 24,
            max_variants_per_candidate: 6,
        }
    }
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            min_width: 320,
            min_height: 240,
            overlay_max_edge_px: 512,
            overlay_white_level: 240,
            overlay_black_level: 15,
            overlay_white_fraction: 0.55,
            overlay_black_fraction: 0.15,
            min_gray_std_dev: 12.0,
            zero_shot_min_positive: 0.35,
            zero_shot_margin: 0.1,
            zero_shot_floor: 0.05,
            category_top_k: 5,
        }
    }
}

impl Default for KeywordConfig {
    fn default() -> Self {
        Self {
            size: strings(&["size", "length", "height", "weight", "wingspan", "mass"]),
            lifespan: strings(&[
                "life span",
                "lifespan",
                "life expectancy",
                "longevity",
                "years old",
            ]),
            habitat: strings(&[
                "habitat",
                "native",
                "found",
                "range",
                "distributed",
                "lives in",
            ]),
            boilerplate_phrases: strings(&[
                "our editors will review",
                "this article was most recently revised",
                "britannica premium",
                "subscribe to britannica",
                "click here to",
                "join britannica",
                "citation style rules",
                "britannica quiz",
            ]),
            negative_alt: strings(&[
                "illustration",
                "drawing",
                "diagram",
                "map",
                "vector",
                "clipart",
                "clip art",
                "logo",
                "icon",
                "silhouette",
                "coat of arms",
                "emblem",
                "badge",
                "flag",
                "statue",
                "sculpture",
                "toy",
                "stuffed",
                "animation",
                "cartoon",
                "poster",
                "typography",
                "text",
                "word",
                "words",
            ]),
            negative_url: strings(&[
                "illustration",
                "vector",
                "logo",
                "icon",
                "diagram",
                "map",
                "clipart",
                "clip-art",
                "silhouette",
                "coat-of-arms",
                "emblem",
                "badge",
                "flag",
                "cartoon",
                "drawing",
                "typography",
                "poster",
                "infographic",
            ]),
            placeholder_url_markers: strings(&[
                "thistle",
                "social-image",
                "placeholder",
                "default",
                "thumbnail",
            ]),
            resize_query_keys: strings(&[
                "width", "w", "height", "h", "crop", "c", "fit", "auto", "quality", "q", "format",
                "fm", "dpr",
            ]),
            animal_labels: default_animal_labels(),
            nature_context: strings(&[
                "wild", "habitat", "nature", "forest", "ocean", "desert", "jungle", "savanna",
                "land", "sea", "reef", "river", "mountain", "tundra",
            ]),
        }
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

fn default_user_agent() -> String {
    format!(
        "fauna-harvest/{} (+https://example.com)",
        env!("CARGO_PKG_VERSION")
    )
}

fn default_animal_labels() -> Vec<String> {
    strings(&[
        "animal",
        "mammal",
        "bird",
        "reptile",
        "amphibian",
        "fish",
        "insect",
        "arachnid",
        "crustacean",
        "mollusk",
        "fox",
        "wolf",
        "dog",
        "canine",
        "cat",
        "feline",
        "lion",
        "tiger",
        "leopard",
        "cheetah",
        "panther",
        "jaguar",
        "lynx",
        "bobcat",
        "bear",
        "panda",
        "koala",
        "kangaroo",
        "wallaby",
        "elephant",
        "giraffe",
        "hippopotamus",
        "rhinoceros",
        "antelope",
        "gazelle",
        "deer",
        "moose",
        "elk",
        "boar",
        "pig",
        "hog",
        "cow",
        "bull",
        "bison",
        "buffalo",
        "camel",
        "alpaca",
        "llama",
        "goat",
        "sheep",
        "horse",
        "zebra",
        "donkey",
        "monkey",
        "ape",
        "orangutan",
        "gorilla",
        "chimp",
        "lemur",
        "ibex",
        "sloth",
        "otter",
        "beaver",
        "weasel",
        "badger",
        "ferret",
        "wolverine",
        "skunk",
        "raccoon",
        "possum",
        "marsupial",
        "rodent",
        "squirrel",
        "mouse",
        "rat",
        "hamster",
        "porcupine",
        "hedgehog",
        "bat",
        "rabbit",
        "hare",
        "seal",
        "walrus",
        "sea lion",
        "manatee",
        "dolphin",
        "whale",
        "orca",
        "narwhal",
        "shark",
        "hammerhead",
        "ray",
        "manta",
        "stingray",
        "eel",
        "salmon",
        "trout",
        "cod",
        "tuna",
        "pike",
        "lionfish",
        "seahorse",
        "frog",
        "bullfrog",
        "toad",
        "salamander",
        "newt",
        "snake",
        "viper",
        "python",
        "cobra",
        "boa",
        "lizard",
        "gecko",
        "iguana",
        "chameleon",
        "dragon",
        "turtle",
        "tortoise",
        "alligator",
        "crocodile",
        "eagle",
        "hawk",
        "falcon",
        "owl",
        "penguin",
        "albatross",
        "pelican",
        "heron",
        "stork",
        "spoonbill",
        "ibis",
        "swan",
        "goose",
        "duck",
        "flamingo",
        "crane",
        "parrot",
        "macaw",
        "toucan",
        "cockatoo",
        "lyrebird",
        "kiwi",
        "emu",
        "cassowary",
        "ostrich",
        "vulture",
        "puffin",
        "kingfisher",
        "hummingbird",
        "bee",
        "ant",
        "butterfly",
        "moth",
        "dragonfly",
        "spider",
        "scorpion",
        "lobster",
        "crab",
        "shrimp",
        "octopus",
        "squid",
        "starfish",
        "urchin",
        "pangolin",
    ])
}

/// Clamps numeric knobs into ranges the pipeline can work with.
pub fn sanitize_config(config: PipelineConfig) -> PipelineConfig {
    let mut sanitized = config;
    sanitized.source.max_attempts = sanitized.source.max_attempts.clamp(1, 10);
    sanitized.source.timeout_secs = sanitized.source.timeout_secs.clamp(1, 300);
    sanitized.source.retry_delay_ms = sanitized.source.retry_delay_ms.min(60_000);
    sanitized.source.min_request_interval_ms =
        sanitized.source.min_request_interval_ms.clamp(1, 60_000);
    sanitized.source.base_url = sanitized.source.base_url.trim_end_matches('/').to_string();
    sanitized.run.max_variants_per_candidate =
        sanitized.run.max_variants_per_candidate.clamp(1, 32);
    sanitized.validator.category_top_k = sanitized.validator.category_top_k.max(1);
    sanitized.paths.asset_prefix = sanitized
        .paths
        .asset_prefix
        .trim_end_matches('/')
        .to_string();
    for table in [
        &mut sanitized.keywords.size,
        &mut sanitized.keywords.lifespan,
        &mut sanitized.keywords.habitat,
        &mut sanitized.keywords.boilerplate_phrases,
        &mut sanitized.keywords.negative_alt,
        &mut sanitized.keywords.negative_url,
        &mut sanitized.keywords.placeholder_url_markers,
        &mut sanitized.keywords.resize_query_keys,
        &mut sanitized.keywords.animal_labels,
        &mut sanitized.keywords.nature_context,
    ] {
        lowercase_and_drop_blank(table);
    }
    sanitized
}

fn lowercase_and_drop_blank(values: &mut Vec<String>) {
    values.retain(|value| !value.trim().is_empty());
    for value in values.iter_mut() {
        *value = value.trim().to_lowercase();
    }
}

/// Default location of the optional config file.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|path| path.join("fauna-harvest").join("config.toml"))
}

/// Default location of the document cache database.
pub fn default_cache_db_path() -> Option<PathBuf> {
    dirs::cache_dir().map(|path| path.join("fauna-harvest").join("documents.sqlite3"))
}

/// Loads `path` when given (it must exist), else the default config file when
/// present, else built-in defaults.
pub fn load_config(path: Option<&Path>) -> Result<PipelineConfig, PipelineError> {
    let resolved = match path {
        Some(explicit) => Some(explicit.to_path_buf()),
        None => default_config_path().filter(|candidate| candidate.exists()),
    };
    let Some(config_file) = resolved else {
        return Ok(sanitize_config(PipelineConfig::default()));
    };
    let content = std::fs::read_to_string(&config_file)
        .map_err(|error| PipelineError::io(&config_file, error))?;
    let parsed = toml::from_str::<PipelineConfig>(&content).map_err(|error| {
        PipelineError::Config(format!("{}: {error}", config_file.display()))
    })?;
    info!("Loaded pipeline config from {}", config_file.display());
    Ok(sanitize_config(parsed))
}

#[cfg(test)]
mod tests {
    use super::{sanitize_config, PipelineConfig};

    #[test]
    fn test_partial_toml_overlays_defaults() {
        let parsed: PipelineConfig = toml::from_str(
            r#"
            [run]
            politeness_delay_ms = 10

            [keywords]
            size = ["Length", "  "]
            "#,
        )
        .expect("partial config should parse");
        let config = sanitize_config(parsed);
        assert_eq!(config.run.politeness_delay_ms, 10);
        assert_eq!(config.run.max_variants_per_candidate, 6);
        assert_eq!(config.keywords.size, vec!["length".to_string()]);
        assert_eq!(config.keywords.lifespan[0], "life span");
        assert_eq!(config.source.max_attempts, 3);
    }

    #[test]
    fn test_sanitize_config_clamps_attempts_and_trims_prefixes() {
        let mut config = PipelineConfig::default();
        config.source.max_attempts = 0;
        config.source.base_url = "https://example.org/".to_string();
        config.paths.asset_prefix = "/assets/animals/".to_string();
        config.run.max_variants_per_candidate = 0;
        let sanitized = sanitize_config(config);
        assert_eq!(sanitized.source.max_attempts, 1);
        assert_eq!(sanitized.source.base_url, "https://example.org");
        assert_eq!(sanitized.paths.asset_prefix, "/assets/animals");
        assert_eq!(sanitized.run.max_variants_per_candidate, 1);
    }

    #[test]
    fn test_positive_alt_includes_nature_and_animal_labels() {
        let config = PipelineConfig::default();
        let positive: Vec<&str> = config.keywords.positive_alt().collect();
        assert!(positive.contains(&"forest"));
        assert!(positive.contains(&"wolf"));
    }
}
