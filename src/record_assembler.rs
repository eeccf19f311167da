//! Per-seed orchestration: document resolution, text selection, image
//! acquisition with run-wide deduplication, persistence and failure collection.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::candidate_extractor::{sanitize_image_variants, CandidateExtractor};
use crate::catalog::{AnimalRecord, Seed};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, RunFailure, SeedFailure};
use crate::image_pipeline;
use crate::image_validator::{ImageAcceptanceValidator, ImageSubmission, StageOutcome};
use crate::sentence_selector::SentenceSelector;
use crate::source_client::ReferenceSource;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub skip_images: bool,
    pub refresh: bool,
}

/// Records built and seeds that failed, in seed order.
#[derive(Debug, Default)]
pub struct RunOutcome {
    pub records: Vec<AnimalRecord>,
    pub failures: Vec<SeedFailure>,
}

impl RunOutcome {
    /// All records, or the aggregated report when any seed failed.
    pub fn into_result(self) -> Result<Vec<AnimalRecord>, RunFailure> {
        if self.failures.is_empty() {
            Ok(self.records)
        } else {
            Err(RunFailure {
                failures: self.failures,
            })
        }
    }
}

/// Image bytes that passed the gate, not yet written.
struct AcceptedImage {
    url: String,
    bytes: Vec<u8>,
    hash: String,
    /// Set when the bytes are already on disk under this seed's name.
    existing_file: Option<String>,
}

pub struct RecordAssembler<'a, S: ReferenceSource> {
    source: S,
    config: &'a PipelineConfig,
    options: RunOptions,
    validator: Option<ImageAcceptanceValidator>,
    extractor: CandidateExtractor<'a>,
    selector: SentenceSelector<'a>,
    /// Content hash -> file name of every image persisted so far.
    saved_images: HashMap<String, String>,
}

impl<'a, S: ReferenceSource> RecordAssembler<'a, S> {
    /// `validator` is `None` in skip-image mode; otherwise a missing validator
    /// accepts every downloaded candidate.
    pub fn new(
        source: S,
        config: &'a PipelineConfig,
        options: RunOptions,
        validator: Option<ImageAcceptanceValidator>,
    ) -> Self {
        let saved_images = if options.skip_images || options.refresh {
            HashMap::new()
        } else {
            image_pipeline::hash_existing_images(&config.paths.image_dir)
        };
        if !saved_images.is_empty() {
            info!(
                "Seeded dedup set with {} existing images from {}",
                saved_images.len(),
                config.paths.image_dir.display()
            );
        }
        Self {
            source,
            options,
            validator,
            extractor: CandidateExtractor::new(
                &config.source.image_selector_groups,
                &config.keywords,
                config.run.max_variants_per_candidate,
            ),
            selector: SentenceSelector::new(
                &config.source.article_paragraph_selectors,
                &config.keywords,
            ),
            saved_images,
            config,
        }
    }

    #[cfg(test)]
    pub fn into_source(self) -> S {
        self.source
    }

    /// Processes every seed in order. A failing seed is recorded and never
    /// stops its successors.
    pub fn run(&mut self, seeds: &[Seed]) -> RunOutcome {
        let mut outcome = RunOutcome::default();
        let delay = Duration::from_millis(self.config.run.politeness_delay_ms);
        for (index, seed) in seeds.iter().enumerate() {
            info!(
                "[{}/{}] Processing {} ({})",
                index + 1,
                seeds.len(),
                seed.scientific_name,
                seed.common_name
            );
            match self.build_record(seed) {
                Ok(record) => outcome.records.push(record),
                Err(cause) => {
                    warn!("Failed to process {}: {}", seed.scientific_name, cause);
                    outcome.failures.push(SeedFailure {
                        scientific_name: seed.scientific_name.clone(),
                        common_name: seed.common_name.clone(),
                        cause,
                    });
                }
            }
            if !delay.is_zero() {
                thread::sleep(delay);
            }
        }
        if let Some(validator) = &self.validator {
            let stats = validator.stats();
            info!(
                "Validator accepted {} and rejected {} candidates",
                stats.accepted, stats.rejected
            );
        }
        outcome
    }

    pub fn build_record(&mut self, seed: &Seed) -> Result<AnimalRecord, PipelineError> {
        let document_url = match self.source.resolve_document_url(&seed.scientific_name) {
            Ok(url) => url,
            Err(error) if error.is_not_found() => {
                debug!(
                    "No result for {}; retrying with {}",
                    seed.scientific_name, seed.common_name
                );
                self.source.resolve_document_url(&seed.common_name)?
            }
            Err(error) => return Err(error),
        };
        let document = self.source.fetch_document(&document_url)?;
        let fields = self.selector.select_fields(&document.parse(), seed)?;

        let image = if self.options.skip_images {
            self.config.paths.placeholder_image.clone()
        } else {
            match self.resolve_image(seed)? {
                Some(accepted) => self.persist(seed, accepted)?,
                None => {
                    info!("No acceptable image for {}; using placeholder", seed.scientific_name);
                    self.config.paths.placeholder_image.clone()
                }
            }
        };

        Ok(AnimalRecord {
            id: seed.id(),
            group: seed.group,
            common_name: seed.common_name.clone(),
            scientific_name: seed.scientific_name.clone(),
            size: fields.size,
            life_expectancy: fields.life_expectancy,
            habitat: fields.habitat,
            fun_fact: fields.fun_fact,
            image,
        })
    }

    fn resolve_image(&mut self, seed: &Seed) -> Result<Option<AcceptedImage>, PipelineError> {
        if let Some(direct_url) = &seed.image_url {
            let variants = sanitize_image_variants(direct_url, &self.config.keywords.resize_query_keys);
            debug!("Trying {} direct image URL(s) for {}", variants.len(), seed.scientific_name);
            for url in &variants {
                if let Some(accepted) = self.try_image_url(seed, url, &seed.common_name) {
                    info!("Selected direct image {} for {}", url, seed.scientific_name);
                    return Ok(Some(accepted));
                }
            }
        }

        for term in seed.search_terms() {
            let document_url = match self.source.resolve_document_url(&term) {
                Ok(url) => url,
                Err(error) if error.is_not_found() => {
                    debug!("No image search result for term '{}'", term);
                    continue;
                }
                Err(error) => return Err(error),
            };
            let document = self.source.fetch_document(&document_url)?;
            let candidates = self.extractor.rank(&document.parse(), &document.url);
            debug!(
                "Found {} image candidates for {} using term '{}'",
                candidates.len(),
                seed.scientific_name,
                term
            );

            let mut attempted: HashSet<&str> = HashSet::new();
            for candidate in &candidates {
                for url in &candidate.urls {
                    if !attempted.insert(url.as_str()) {
                        continue;
                    }
                    if let Some(accepted) = self.try_image_url(seed, url, &candidate.alt_text) {
                        info!("Selected image {} for {}", url, seed.scientific_name);
                        return Ok(Some(accepted));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Download, dedup check and acceptance gate for one URL. Any failure only
    /// exhausts this URL.
    fn try_image_url(&mut self, seed: &Seed, url: &str, alt_text: &str) -> Option<AcceptedImage> {
        let bytes = match self.source.download_bytes(url) {
            Ok(bytes) => bytes,
            Err(error) => {
                debug!("Download failed for {}: {}", url, error);
                return None;
            }
        };
        let hash = image_pipeline::content_hash(&bytes);
        let mut existing_file = None;
        if let Some(owner) = self.saved_images.get(&hash) {
            if !is_named_for(owner, &seed.id()) {
                debug!("Skipping duplicate image {} (same bytes as {})", url, owner);
                return None;
            }
            existing_file = Some(owner.clone());
        }

        if let Some(validator) = self.validator.as_mut() {
            let verdict = validator.evaluate(&ImageSubmission {
                bytes: &bytes,
                alt_text,
                scientific_name: &seed.scientific_name,
                common_name: &seed.common_name,
                source_url: url,
            });
            if !verdict.accepted() {
                if let Some(rejection) = verdict
                    .stages
                    .iter()
                    .find(|stage| stage.outcome == StageOutcome::Reject)
                {
                    debug!(
                        "Rejected {} at {:?} stage: {}",
                        url, rejection.stage, rejection.detail
                    );
                }
                return None;
            }
        }
        Some(AcceptedImage {
            url: url.to_string(),
            bytes,
            hash,
            existing_file,
        })
    }

    /// Writes the accepted bytes under the seed's slug unless a same-named file
    /// already exists and refresh was not requested. Returns the public path.
    fn persist(&mut self, seed: &Seed, accepted: AcceptedImage) -> Result<String, PipelineError> {
        let filename = match accepted.existing_file {
            Some(existing) => {
                debug!("Reusing {} already on disk for {}", existing, seed.scientific_name);
                existing
            }
            None => {
                let filename =
                    image_pipeline::derive_image_filename(&accepted.url, &seed.id(), &accepted.bytes);
                let target_path = self.config.paths.image_dir.join(&filename);
                if self.options.refresh || !target_path.exists() {
                    image_pipeline::write_atomic(&target_path, &accepted.bytes)?;
                    debug!("Wrote {}", target_path.display());
                } else {
                    debug!("Keeping existing {}", target_path.display());
                }
                filename
            }
        };
        self.saved_images.insert(accepted.hash, filename.clone());
        Ok(format!("{}/{}", self.config.paths.asset_prefix, filename))
    }
}

fn is_named_for(filename: &str, slug: &str) -> bool {
    Path::new(filename)
        .file_stem()
        .is_some_and(|stem| stem.to_string_lossy() == slug)
}
