//! Multi-stage acceptance gate deciding whether downloaded bytes are a usable
//! photograph of the target animal.
//!
//! Stages run in a fixed order and the first rejection short-circuits. Every
//! stage verdict is recorded on the returned [`Verdict`] and logged at debug
//! level so a run can be audited candidate by candidate.

use std::fmt;

use image::{DynamicImage, GenericImageView, GrayImage};
use log::{debug, warn};

use crate::classifiers::{CategoryClassifier, LazyClassifier, ZeroShotClassifier};
use crate::config::{KeywordConfig, ValidatorConfig};
use crate::image_pipeline;

pub const ZERO_SHOT_PROMPTS: [&str; 5] = [
    "a photo of a living animal in the wild",
    "a photo of a living animal in its natural habitat",
    "a drawing or illustration of an animal",
    "an image of an animal statue or toy",
    "an image with text over a picture of an animal",
];
const POSITIVE_PROMPT_COUNT: usize = 2;
const MIN_NAME_TOKEN_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Payload,
    Keywords,
    Decode,
    Resolution,
    TextOverlay,
    ZeroShot,
    Variance,
    AltContext,
    Category,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Pass,
    /// The stage had nothing to decide (capability absent or not applicable).
    PassThrough,
    Reject,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageVerdict {
    pub stage: Stage,
    pub outcome: StageOutcome,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    EmptyPayload,
    NegativeKeyword,
    Undecodable,
    LowResolution { width: u32, height: u32 },
    TextOverlay,
    NotNaturalPhoto,
    LowVariance,
    AltLacksContext,
    NoAnimalDetected,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyPayload => write!(f, "empty payload"),
            Self::NegativeKeyword => write!(f, "negative keyword in URL or alt text"),
            Self::Undecodable => write!(f, "cannot decode image and alt text does not name the animal"),
            Self::LowResolution { width, height } => {
                write!(f, "resolution {width}x{height} below threshold")
            }
            Self::TextOverlay => write!(f, "detected text overlay"),
            Self::NotNaturalPhoto => write!(f, "zero-shot classifier flagged a non-natural image"),
            Self::LowVariance => write!(f, "grayscale variance too low"),
            Self::AltLacksContext => write!(f, "alt text lacks animal context"),
            Self::NoAnimalDetected => write!(f, "category classifier found no animal"),
        }
    }
}

/// Outcome of one pass through the gate.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub reject_reason: Option<RejectReason>,
    pub stages: Vec<StageVerdict>,
}

impl Verdict {
    pub fn accepted(&self) -> bool {
        self.reject_reason.is_none()
    }
}

/// Everything the gate knows about one candidate.
#[derive(Debug, Clone, Copy)]
pub struct ImageSubmission<'a> {
    pub bytes: &'a [u8],
    pub alt_text: &'a str,
    pub scientific_name: &'a str,
    pub common_name: &'a str,
    pub source_url: &'a str,
}

impl ImageSubmission<'_> {
    fn descriptor(&self) -> &str {
        [self.source_url, self.alt_text, self.scientific_name]
            .into_iter()
            .find(|value| !value.is_empty())
            .unwrap_or("<unknown>")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidatorStats {
    pub accepted: usize,
    pub rejected: usize,
}

struct Audit<'a> {
    descriptor: &'a str,
    stages: Vec<StageVerdict>,
}

impl Audit<'_> {
    fn record(&mut self, stage: Stage, outcome: StageOutcome, detail: impl Into<String>) {
        let detail = detail.into();
        debug!(
            "Validator[{}]: {:?} -> {:?} ({})",
            self.descriptor, stage, outcome, detail
        );
        self.stages.push(StageVerdict {
            stage,
            outcome,
            detail,
        });
    }

    fn reject(mut self, stage: Stage, reason: RejectReason) -> Verdict {
        self.record(stage, StageOutcome::Reject, reason.to_string());
        Verdict {
            reject_reason: Some(reason),
            stages: self.stages,
        }
    }

    fn accept(self) -> Verdict {
        Verdict {
            reject_reason: None,
            stages: self.stages,
        }
    }
}

pub struct ImageAcceptanceValidator {
    config: ValidatorConfig,
    keywords: KeywordConfig,
    zero_shot: LazyClassifier<dyn ZeroShotClassifier>,
    category: LazyClassifier<dyn CategoryClassifier>,
    stats: ValidatorStats,
}

impl ImageAcceptanceValidator {
    pub fn new(
        config: ValidatorConfig,
        keywords: KeywordConfig,
        zero_shot: LazyClassifier<dyn ZeroShotClassifier>,
        category: LazyClassifier<dyn CategoryClassifier>,
    ) -> Self {
        Self {
            config,
            keywords,
            zero_shot,
            category,
            stats: ValidatorStats::default(),
        }
    }

    /// Heuristic-only gate with no learned classifiers.
    pub fn heuristic(config: ValidatorConfig, keywords: KeywordConfig) -> Self {
        Self::new(
            config,
            keywords,
            LazyClassifier::unavailable("zero-shot"),
            LazyClassifier::unavailable("category"),
        )
    }

    pub fn stats(&self) -> ValidatorStats {
        self.stats
    }

    #[cfg(test)]
    pub fn accepts(&mut self, submission: &ImageSubmission<'_>) -> bool {
        self.evaluate(submission).accepted()
    }

    pub fn evaluate(&mut self, submission: &ImageSubmission<'_>) -> Verdict {
        let verdict = self.run_stages(submission);
        if verdict.accepted() {
            self.stats.accepted += 1;
            debug!("Accepted {}", submission.descriptor());
        } else {
            self.stats.rejected += 1;
        }
        verdict
    }

    fn run_stages(&self, submission: &ImageSubmission<'_>) -> Verdict {
        let mut audit = Audit {
            descriptor: submission.descriptor(),
            stages: Vec::new(),
        };

        if submission.bytes.is_empty() {
            return audit.reject(Stage::Payload, RejectReason::EmptyPayload);
        }
        audit.record(
            Stage::Payload,
            StageOutcome::Pass,
            format!("{} bytes", submission.bytes.len()),
        );

        let alt_lower = submission.alt_text.trim().to_lowercase();
        let strong_match =
            alt_names_animal(&alt_lower, submission.scientific_name, submission.common_name);
        let url_lower = submission.source_url.to_lowercase();
        if contains_any(&url_lower, &self.keywords.negative_url)
            || contains_any(&alt_lower, &self.keywords.negative_alt)
        {
            return audit.reject(Stage::Keywords, RejectReason::NegativeKeyword);
        }
        audit.record(Stage::Keywords, StageOutcome::Pass, "no negative keywords");

        let Some(image) = image_pipeline::decode_image_from_memory_with_fallback(submission.bytes)
        else {
            if strong_match {
                audit.record(
                    Stage::Decode,
                    StageOutcome::PassThrough,
                    "undecodable but alt text names the animal",
                );
                return audit.accept();
            }
            return audit.reject(Stage::Decode, RejectReason::Undecodable);
        };
        let (width, height) = image.dimensions();
        audit.record(Stage::Decode, StageOutcome::Pass, format!("{width}x{height}"));

        if width < self.config.min_width || height < self.config.min_height {
            return audit.reject(
                Stage::Resolution,
                RejectReason::LowResolution { width, height },
            );
        }
        audit.record(Stage::Resolution, StageOutcome::Pass, "");

        let preview = image_pipeline::downscaled_gray(&image, self.config.overlay_max_edge_px);
        match image_pipeline::tone_fractions(
            &preview,
            self.config.overlay_white_level,
            self.config.overlay_black_level,
        ) {
            Some(fractions)
                if fractions.white > self.config.overlay_white_fraction
                    && fractions.black > self.config.overlay_black_fraction =>
            {
                return audit.reject(Stage::TextOverlay, RejectReason::TextOverlay);
            }
            Some(fractions) => audit.record(
                Stage::TextOverlay,
                StageOutcome::Pass,
                format!("white={:.3} black={:.3}", fractions.white, fractions.black),
            ),
            None => audit.record(Stage::TextOverlay, StageOutcome::PassThrough, "empty image"),
        }

        // `None` until the category classifier has been consulted for this image;
        // then `Some(None)` when it gave no answer.
        let mut category_verdict: Option<Option<bool>> = None;

        let zero_shot_confirmed = match self.zero_shot_scores(&image) {
            None => {
                audit.record(Stage::ZeroShot, StageOutcome::PassThrough, "classifier unavailable");
                false
            }
            Some((positive, negative)) => {
                let passed = positive >= self.config.zero_shot_min_positive
                    && positive >= negative + self.config.zero_shot_margin;
                let scores = format!("positive={positive:.3} negative={negative:.3}");
                if passed {
                    audit.record(Stage::ZeroShot, StageOutcome::Pass, scores);
                    true
                } else if positive < self.config.zero_shot_floor && !strong_match {
                    return audit.reject(Stage::ZeroShot, RejectReason::NotNaturalPhoto);
                } else {
                    let category = self.category_confirms(&image);
                    category_verdict = Some(category);
                    if category == Some(true) {
                        audit.record(
                            Stage::ZeroShot,
                            StageOutcome::PassThrough,
                            format!("{scores}; overridden by category classifier"),
                        );
                    } else if strong_match {
                        audit.record(
                            Stage::ZeroShot,
                            StageOutcome::PassThrough,
                            format!("{scores}; overridden by alt text name match"),
                        );
                    } else {
                        return audit.reject(Stage::ZeroShot, RejectReason::NotNaturalPhoto);
                    }
                    false
                }
            }
        };

        if zero_shot_confirmed {
            audit.record(Stage::Variance, StageOutcome::PassThrough, "zero-shot confirmed");
        } else {
            let full_gray: GrayImage = image.to_luma8();
            let std_dev = image_pipeline::gray_std_dev(&full_gray);
            if std_dev <= self.config.min_gray_std_dev {
                return audit.reject(Stage::Variance, RejectReason::LowVariance);
            }
            audit.record(Stage::Variance, StageOutcome::Pass, format!("std_dev={std_dev:.2}"));
        }

        if !alt_lower.is_empty()
            && !strong_match
            && !self.alt_supports(&alt_lower, submission.scientific_name, submission.common_name)
        {
            return audit.reject(Stage::AltContext, RejectReason::AltLacksContext);
        }
        audit.record(Stage::AltContext, StageOutcome::Pass, "");

        if zero_shot_confirmed {
            audit.record(Stage::Category, StageOutcome::PassThrough, "zero-shot confirmed");
            return audit.accept();
        }
        let category = match category_verdict {
            Some(cached) => cached,
            None => self.category_confirms(&image),
        };
        match category {
            Some(false) => return audit.reject(Stage::Category, RejectReason::NoAnimalDetected),
            Some(true) => audit.record(Stage::Category, StageOutcome::Pass, "animal label"),
            None => audit.record(Stage::Category, StageOutcome::PassThrough, "no verdict"),
        }

        audit.accept()
    }

    /// Best positive and best negative prompt probability, when available.
    fn zero_shot_scores(&self, image: &DynamicImage) -> Option<(f32, f32)> {
        let classifier = self.zero_shot.get()?;
        let probabilities = match classifier.score_prompts(image, &ZERO_SHOT_PROMPTS) {
            Ok(probabilities) if probabilities.len() == ZERO_SHOT_PROMPTS.len() => probabilities,
            Ok(probabilities) => {
                warn!(
                    "{} classifier returned {} scores for {} prompts; ignoring",
                    self.zero_shot.name(),
                    probabilities.len(),
                    ZERO_SHOT_PROMPTS.len()
                );
                return None;
            }
            Err(error) => {
                warn!("{} classifier failed: {}", self.zero_shot.name(), error);
                return None;
            }
        };
        let (positive, negative) = probabilities.split_at(POSITIVE_PROMPT_COUNT);
        let best = |values: &[f32]| values.iter().copied().fold(f32::MIN, f32::max);
        Some((best(positive), best(negative)))
    }

    fn category_confirms(&self, image: &DynamicImage) -> Option<bool> {
        let classifier = self.category.get()?;
        match classifier.top_labels(image, self.config.category_top_k) {
            Ok(labels) => {
                debug!(
                    "Category labels: {}",
                    labels
                        .iter()
                        .map(|(label, probability)| format!("{label}:{probability:.3}"))
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                Some(labels.iter().take(self.config.category_top_k).any(|(label, _)| {
                    contains_any(&label.to_lowercase(), &self.keywords.animal_labels)
                }))
            }
            Err(error) => {
                warn!("{} classifier failed: {}", self.category.name(), error);
                None
            }
        }
    }

    fn alt_supports(&self, alt_lower: &str, scientific_name: &str, common_name: &str) -> bool {
        if self
            .keywords
            .positive_alt()
            .any(|keyword| alt_lower.contains(keyword))
        {
            return true;
        }
        [scientific_name, common_name]
            .iter()
            .flat_map(|name| name.split(|ch: char| !ch.is_ascii_alphanumeric()))
            .map(str::to_lowercase)
            .filter(|token| token.len() >= MIN_NAME_TOKEN_LEN)
            .any(|token| alt_lower.contains(&token))
    }
}

fn contains_any(haystack: &str, keywords: &[String]) -> bool {
    !haystack.is_empty() && keywords.iter().any(|keyword| haystack.contains(keyword.as_str()))
}

/// Alt text contains the scientific or common name verbatim (case-insensitive).
fn alt_names_animal(alt_lower: &str, scientific_name: &str, common_name: &str) -> bool {
    if alt_lower.is_empty() {
        return false;
    }
    [scientific_name, common_name].iter().any(|name| {
        let name = name.trim().to_lowercase();
        !name.is_empty() && alt_lower.contains(&name)
    })
}

#[cfg(test)]
mod tests {
    use super::{
        ImageAcceptanceValidator, ImageSubmission, RejectReason, Stage, StageOutcome,
    };
    use crate::classifiers::{CategoryClassifier, LazyClassifier, ZeroShotClassifier};
    use crate::config::{KeywordConfig, ValidatorConfig};
    use image::{DynamicImage, ImageBuffer, ImageFormat, Luma, Rgb};
    use std::cell::Cell;
    use std::io::Cursor;
    use std::rc::Rc;

    struct FixedPrompts(Vec<f32>);

    impl ZeroShotClassifier for FixedPrompts {
        fn score_prompts(&self, _image: &DynamicImage, _prompts: &[&str]) -> Result<Vec<f32>, String> {
            Ok(self.0.clone())
        }
    }

    struct FixedLabels(Vec<&'static str>);

    impl CategoryClassifier for FixedLabels {
        fn top_labels(&self, _image: &DynamicImage, k: usize) -> Result<Vec<(String, f32)>, String> {
            Ok(self
                .0
                .iter()
                .take(k)
                .map(|label| (label.to_string(), 0.2))
                .collect())
        }
    }

    fn encode_png(image: DynamicImage) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        image
            .write_to(&mut cursor, ImageFormat::Png)
            .expect("png encoding should succeed");
        cursor.into_inner()
    }

    fn textured_photo(width: u32, height: u32) -> Vec<u8> {
        encode_png(DynamicImage::ImageRgb8(ImageBuffer::from_fn(width, height, |x, y| {
            let level = ((x * 31 + y * 17) % 200 + 20) as u8;
            Rgb([level, level.saturating_sub(10), level / 2])
        })))
    }

    fn flat_image(width: u32, height: u32) -> Vec<u8> {
        encode_png(DynamicImage::ImageLuma8(ImageBuffer::from_pixel(
            width,
            height,
            Luma([128]),
        )))
    }

    fn overlay_image() -> Vec<u8> {
        encode_png(DynamicImage::ImageLuma8(ImageBuffer::from_fn(640, 480, |_, y| {
            if y < 336 {
                Luma([255])
            } else {
                Luma([0])
            }
        })))
    }

    fn heuristic() -> ImageAcceptanceValidator {
        ImageAcceptanceValidator::heuristic(ValidatorConfig::default(), KeywordConfig::default())
    }

    fn with_classifiers(
        prompts: Option<Vec<f32>>,
        labels: Option<Vec<&'static str>>,
    ) -> ImageAcceptanceValidator {
        let zero_shot = match prompts {
            Some(scores) => LazyClassifier::ready(
                "zero-shot",
                Box::new(FixedPrompts(scores)) as Box<dyn ZeroShotClassifier>,
            ),
            None => LazyClassifier::unavailable("zero-shot"),
        };
        let category = match labels {
            Some(labels) => LazyClassifier::ready(
                "category",
                Box::new(FixedLabels(labels)) as Box<dyn CategoryClassifier>,
            ),
            None => LazyClassifier::unavailable("category"),
        };
        ImageAcceptanceValidator::new(
            ValidatorConfig::default(),
            KeywordConfig::default(),
            zero_shot,
            category,
        )
    }

    fn submission<'a>(bytes: &'a [u8], alt_text: &'a str) -> ImageSubmission<'a> {
        ImageSubmission {
            bytes,
            alt_text,
            scientific_name: "Canis lupus",
            common_name: "Gray wolf",
            source_url: "https://cdn.test/media/wolf.jpg",
        }
    }

    #[test]
    fn test_empty_payload_is_rejected() {
        let verdict = heuristic().evaluate(&submission(&[], "Gray wolf"));
        assert_eq!(verdict.reject_reason, Some(RejectReason::EmptyPayload));
    }

    #[test]
    fn test_negative_url_keyword_is_rejected() {
        let bytes = textured_photo(640, 480);
        let mut request = submission(&bytes, "Gray wolf");
        request.source_url = "https://cdn.test/media/wolf-range-map.png";
        assert_eq!(
            heuristic().evaluate(&request).reject_reason,
            Some(RejectReason::NegativeKeyword)
        );
    }

    #[test]
    fn test_undecodable_payload_accepted_when_alt_names_species() {
        let mut validator = heuristic();
        assert!(validator.accepts(&submission(b"not an image", "Canis lupus howling at dusk")));
        assert_eq!(
            validator.evaluate(&submission(b"not an image", "Sunset")).reject_reason,
            Some(RejectReason::Undecodable)
        );
        assert_eq!(validator.stats().accepted, 1);
        assert_eq!(validator.stats().rejected, 1);
    }

    #[test]
    fn test_small_image_rejected_regardless_of_alt_or_classifiers() {
        let bytes = textured_photo(300, 400);
        let mut validator = with_classifiers(
            Some(vec![0.9, 0.05, 0.02, 0.02, 0.01]),
            Some(vec!["timber wolf"]),
        );
        assert_eq!(
            validator
                .evaluate(&submission(&bytes, "Gray wolf Canis lupus"))
                .reject_reason,
            Some(RejectReason::LowResolution {
                width: 300,
                height: 400
            })
        );
    }

    #[test]
    fn test_text_overlay_is_rejected() {
        let bytes = overlay_image();
        assert_eq!(
            heuristic().evaluate(&submission(&bytes, "")).reject_reason,
            Some(RejectReason::TextOverlay)
        );
    }

    #[test]
    fn test_heuristic_gate_accepts_textured_photo_and_rejects_flat_image() {
        let mut validator = heuristic();
        let photo = textured_photo(640, 480);
        let verdict = validator.evaluate(&submission(&photo, "Gray wolf in forest"));
        assert!(verdict.accepted());
        assert!(verdict.stages.iter().any(|stage| stage.stage == Stage::Category
            && stage.outcome == StageOutcome::PassThrough));

        let flat = flat_image(640, 480);
        assert_eq!(
            validator.evaluate(&submission(&flat, "")).reject_reason,
            Some(RejectReason::LowVariance)
        );
    }

    #[test]
    fn test_zero_shot_confirmation_skips_variance_check() {
        let flat = flat_image(640, 480);
        let mut validator = with_classifiers(Some(vec![0.7, 0.1, 0.1, 0.05, 0.05]), None);
        let verdict = validator.evaluate(&submission(&flat, ""));
        assert!(verdict.accepted());
    }

    #[test]
    fn test_low_confidence_zero_shot_rejection_cannot_be_overridden_by_category() {
        let photo = textured_photo(640, 480);
        let mut validator = with_classifiers(
            Some(vec![0.02, 0.01, 0.9, 0.05, 0.02]),
            Some(vec!["timber wolf"]),
        );
        assert_eq!(
            validator.evaluate(&submission(&photo, "")).reject_reason,
            Some(RejectReason::NotNaturalPhoto)
        );
        // A verbatim name match still earns the override path.
        assert!(validator.accepts(&submission(&photo, "Gray wolf resting")));
    }

    #[test]
    fn test_category_label_overrides_moderate_zero_shot_rejection() {
        let photo = textured_photo(640, 480);
        let mut overridden = with_classifiers(
            Some(vec![0.2, 0.1, 0.6, 0.05, 0.05]),
            Some(vec!["timber wolf", "coyote"]),
        );
        assert!(overridden.accepts(&submission(&photo, "")));

        let mut rejected = with_classifiers(
            Some(vec![0.2, 0.1, 0.6, 0.05, 0.05]),
            Some(vec!["bookcase", "envelope"]),
        );
        assert_eq!(
            rejected.evaluate(&submission(&photo, "")).reject_reason,
            Some(RejectReason::NotNaturalPhoto)
        );
    }

    #[test]
    fn test_alt_text_without_context_is_rejected() {
        let photo = textured_photo(640, 480);
        assert_eq!(
            heuristic()
                .evaluate(&submission(&photo, "sunset over hills"))
                .reject_reason,
            Some(RejectReason::AltLacksContext)
        );
        // A name token is enough context.
        assert!(heuristic().accepts(&submission(&photo, "lupus pup")));
    }

    #[test]
    fn test_explicit_negative_category_verdict_rejects() {
        let photo = textured_photo(640, 480);
        let mut validator = with_classifiers(None, Some(vec!["bookcase"]));
        assert_eq!(
            validator.evaluate(&submission(&photo, "")).reject_reason,
            Some(RejectReason::NoAnimalDetected)
        );
    }

    #[test]
    fn test_classifier_factory_runs_once_across_candidates() {
        let builds = Rc::new(Cell::new(0usize));
        let counter = Rc::clone(&builds);
        let category: LazyClassifier<dyn CategoryClassifier> =
            LazyClassifier::new("category", move || {
                counter.set(counter.get() + 1);
                Some(Box::new(FixedLabels(vec!["grey wolf"])) as Box<dyn CategoryClassifier>)
            });
        let mut validator = ImageAcceptanceValidator::new(
            ValidatorConfig::default(),
            KeywordConfig::default(),
            LazyClassifier::unavailable("zero-shot"),
            category,
        );
        let photo = textured_photo(640, 480);
        assert!(validator.accepts(&submission(&photo, "")));
        assert!(validator.accepts(&submission(&photo, "wolf")));
        assert_eq!(builds.get(), 1);
    }
}
