//! Discovers image candidates on a fetched document and ranks them.

use std::collections::HashSet;

use log::{debug, warn};
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::config::KeywordConfig;
use crate::source_client::join_url;

const POSITIVE_ALT_BONUS: i64 = 2500;
const NEGATIVE_ALT_PENALTY: i64 = 3000;
const DENSITY_WIDTH_SCALE: f64 = 1000.0;
const SKIP_MARKERS: [&str; 2] = ["logo", "placeholder"];
const SRCSET_ATTRS: [&str; 2] = ["data-srcset", "srcset"];
const DIRECT_SOURCE_ATTRS: [&str; 4] = ["data-src", "data-original", "data-url", "src"];

/// One discovered image: URL variants of the same picture, most specific first.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageCandidate {
    pub urls: Vec<String>,
    pub alt_text: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub score: i64,
}

pub struct CandidateExtractor<'a> {
    selector_groups: Vec<Selector>,
    keywords: &'a KeywordConfig,
    max_variants: usize,
}

impl<'a> CandidateExtractor<'a> {
    pub fn new(selector_groups: &[String], keywords: &'a KeywordConfig, max_variants: usize) -> Self {
        let selector_groups = selector_groups
            .iter()
            .filter_map(|raw| match Selector::parse(raw) {
                Ok(selector) => Some(selector),
                Err(error) => {
                    warn!("Ignoring invalid image selector '{}': {:?}", raw, error);
                    None
                }
            })
            .collect();
        Self {
            selector_groups,
            keywords,
            max_variants: max_variants.max(1),
        }
    }

    /// Returns candidates sorted by descending score; ties keep encounter order.
    pub fn rank(&self, document: &Html, base_url: &str) -> Vec<ImageCandidate> {
        let mut candidates = Vec::new();
        let mut seen_nodes = HashSet::new();
        let mut seen_urls: HashSet<String> = HashSet::new();

        for selector in &self.selector_groups {
            for element in document.select(selector) {
                if !seen_nodes.insert(element.id()) {
                    continue;
                }
                if let Some(candidate) = self.consider(element, base_url, &mut seen_urls) {
                    candidates.push(candidate);
                }
            }
        }

        candidates.sort_by(|left, right| right.score.cmp(&left.score));
        debug!("Ranked {} image candidates on {}", candidates.len(), base_url);
        candidates
    }

    fn consider(
        &self,
        element: ElementRef<'_>,
        base_url: &str,
        seen_urls: &mut HashSet<String>,
    ) -> Option<ImageCandidate> {
        let img = element.value();
        let has_marked_class = img.classes().any(|class| {
            let lowered = class.to_lowercase();
            SKIP_MARKERS.iter().any(|marker| lowered.contains(marker))
        });
        if has_marked_class {
            return None;
        }

        let alt_text = img.attr("alt").unwrap_or_default().trim().to_string();
        let alt_lower = alt_text.to_lowercase();
        if SKIP_MARKERS.iter().any(|marker| alt_lower.contains(marker)) {
            return None;
        }

        let mut entries: Vec<(String, Option<u32>)> = Vec::new();
        if let Some(srcset) = SRCSET_ATTRS
            .iter()
            .find_map(|attr| img.attr(attr).filter(|value| !value.trim().is_empty()))
        {
            entries.extend(parse_srcset(srcset));
        }

        let direct_width = img
            .attr("data-width")
            .and_then(parse_dimension)
            .or_else(|| img.attr("width").and_then(parse_dimension));
        let direct_height = img
            .attr("data-height")
            .and_then(parse_dimension)
            .or_else(|| img.attr("height").and_then(parse_dimension));
        if let Some(direct) = DIRECT_SOURCE_ATTRS
            .iter()
            .find_map(|attr| img.attr(attr).filter(|value| !value.trim().is_empty()))
        {
            entries.push((direct.trim().to_string(), direct_width));
        }

        let mut urls: Vec<String> = Vec::new();
        let mut max_width: Option<u32> = None;
        'entries: for (raw_url, width) in entries {
            let Some(absolute) = join_url(base_url, &raw_url) else {
                continue;
            };
            if self.is_excluded_url(&absolute) {
                continue;
            }
            if let Some(width) = width {
                max_width = Some(max_width.map_or(width, |current| current.max(width)));
            }
            for variant in sanitize_image_variants(&absolute, &self.keywords.resize_query_keys) {
                if urls.len() >= self.max_variants {
                    break 'entries;
                }
                if seen_urls.insert(variant.clone()) {
                    urls.push(variant);
                }
            }
        }

        if urls.is_empty() {
            return None;
        }

        let score = self.score(max_width, direct_height, &alt_lower);
        Some(ImageCandidate {
            urls,
            alt_text,
            width: max_width,
            height: direct_height,
            score,
        })
    }

    fn is_excluded_url(&self, absolute: &str) -> bool {
        let lowered = absolute.to_lowercase();
        self.keywords
            .placeholder_url_markers
            .iter()
            .chain(self.keywords.negative_url.iter())
            .any(|keyword| lowered.contains(keyword.as_str()))
    }

    fn score(&self, width: Option<u32>, height: Option<u32>, alt_lower: &str) -> i64 {
        let mut score = i64::from(width.unwrap_or(0)) * 4 + i64::from(height.unwrap_or(0));
        if !alt_lower.is_empty() {
            if self
                .keywords
                .positive_alt()
                .any(|keyword| alt_lower.contains(keyword))
            {
                score += POSITIVE_ALT_BONUS;
            }
            if self
                .keywords
                .negative_alt
                .iter()
                .any(|keyword| alt_lower.contains(keyword.as_str()))
            {
                score -= NEGATIVE_ALT_PENALTY;
            }
        }
        score
    }
}

/// Parses `"<url> <descriptor>"` pairs, widest first.
///
/// Density descriptors (`2x`) are scaled to a large synthetic width; entries
/// without a descriptor sort last.
pub fn parse_srcset(value: &str) -> Vec<(String, Option<u32>)> {
    let mut entries: Vec<(String, Option<u32>)> = value
        .split(',')
        .filter_map(|chunk| {
            let chunk = chunk.trim();
            if chunk.is_empty() {
                return None;
            }
            let (url_part, descriptor) = chunk.split_once(char::is_whitespace).unwrap_or((chunk, ""));
            Some((url_part.to_string(), parse_descriptor(descriptor.trim())))
        })
        .collect();
    entries.sort_by(|left, right| right.1.unwrap_or(0).cmp(&left.1.unwrap_or(0)));
    entries
}

fn parse_descriptor(descriptor: &str) -> Option<u32> {
    let lowered = descriptor.to_lowercase();
    if let Some(number) = lowered.strip_suffix('w') {
        return number.trim().parse::<u32>().ok();
    }
    if let Some(number) = lowered.strip_suffix('x') {
        let density = number.trim().parse::<f64>().ok()?;
        if density.is_finite() && density > 0.0 {
            return Some((density * DENSITY_WIDTH_SCALE).round().min(f64::from(u32::MAX)) as u32);
        }
    }
    None
}

/// Parses width/height attribute values such as `"640"`, `"640px"` or `"640x480"`.
pub fn parse_dimension(value: &str) -> Option<u32> {
    let lowered = value.trim().to_lowercase().replace("px", "");
    let head = lowered.split('x').next().unwrap_or_default().trim();
    if head.is_empty() {
        return None;
    }
    let parsed = head.parse::<f64>().ok()?;
    if !parsed.is_finite() || parsed < 0.0 {
        return None;
    }
    Some(parsed.min(f64::from(u32::MAX)) as u32)
}

/// Returns the URL with resize query parameters stripped, followed by the
/// original when it differs. Non-absolute input is returned unchanged.
pub fn sanitize_image_variants(url: &str, resize_keys: &[String]) -> Vec<String> {
    let Ok(mut parsed) = Url::parse(url) else {
        return vec![url.to_string()];
    };
    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| {
            let key = key.to_lowercase();
            !resize_keys.iter().any(|resize_key| *resize_key == key)
        })
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(kept);
    }

    let sanitized = parsed.to_string();
    let mut variants = vec![sanitized];
    if variants[0] != url {
        variants.push(url.to_string());
    }
    variants
}

#[cfg(test)]
mod tests {
    use super::{parse_dimension, parse_srcset, sanitize_image_variants, CandidateExtractor};
    use crate::config::{KeywordConfig, SourceConfig};
    use scraper::Html;
    use std::collections::HashSet;

    const BASE: &str = "https://ref.test/animal/gray-wolf";

    fn rank(html: &str) -> Vec<super::ImageCandidate> {
        let keywords = KeywordConfig::default();
        let extractor =
            CandidateExtractor::new(&SourceConfig::default().image_selector_groups, &keywords, 6);
        extractor.rank(&Html::parse_document(html), BASE)
    }

    #[test]
    fn test_parse_srcset_sorts_widest_first_and_scales_density() {
        let entries = parse_srcset("a.jpg 320w, b.jpg 1200w, c.jpg 2x, d.jpg");
        assert_eq!(
            entries,
            vec![
                ("c.jpg".to_string(), Some(2000)),
                ("b.jpg".to_string(), Some(1200)),
                ("a.jpg".to_string(), Some(320)),
                ("d.jpg".to_string(), None),
            ]
        );
    }

    #[test]
    fn test_parse_dimension_handles_units_and_pairs() {
        assert_eq!(parse_dimension("640"), Some(640));
        assert_eq!(parse_dimension("640px"), Some(640));
        assert_eq!(parse_dimension("800x600"), Some(800));
        assert_eq!(parse_dimension("12.7"), Some(12));
        assert_eq!(parse_dimension("auto"), None);
        assert_eq!(parse_dimension(""), None);
    }

    #[test]
    fn test_sanitize_strips_resize_params_and_keeps_original() {
        let keys = KeywordConfig::default().resize_query_keys;
        assert_eq!(
            sanitize_image_variants("https://cdn.test/a.jpg?w=300&q=60&id=7", &keys),
            vec![
                "https://cdn.test/a.jpg?id=7".to_string(),
                "https://cdn.test/a.jpg?w=300&q=60&id=7".to_string(),
            ]
        );
        assert_eq!(
            sanitize_image_variants("https://cdn.test/a.jpg", &keys),
            vec!["https://cdn.test/a.jpg".to_string()]
        );
        assert_eq!(
            sanitize_image_variants("relative/a.jpg", &keys),
            vec!["relative/a.jpg".to_string()]
        );
    }

    #[test]
    fn test_rank_orders_by_score_and_skips_logos_and_placeholders() {
        let candidates = rank(
            r#"<html><body>
            <img class="site-logo" src="/brand.png" alt="Brand">
            <img src="/media/placeholder-wolf.jpg" alt="Gray wolf">
            <img src="/media/small.jpg" width="200" height="150" alt="">
            <figure><img src="/media/big.jpg?w=800" width="800" height="600" alt="Gray wolf in forest"></figure>
            </body></html>"#,
        );
        assert_eq!(candidates.len(), 2);
        assert_eq!(
            candidates[0].urls,
            vec![
                "https://ref.test/media/big.jpg".to_string(),
                "https://ref.test/media/big.jpg?w=800".to_string(),
            ]
        );
        assert_eq!(candidates[0].score, 800 * 4 + 600 + 2500);
        assert_eq!(candidates[1].score, 200 * 4 + 150);
    }

    #[test]
    fn test_rank_visits_each_element_once_and_never_repeats_urls() {
        let candidates = rank(
            r#"<figure class="md-assembly"><img src="/media/a.jpg" alt="wolf"></figure>
               <img src="/media/a.jpg" alt="wolf again">
               <img srcset="/media/b.jpg?w=400 400w, /media/b.jpg?w=800 800w" alt="wolf pack">"#,
        );
        assert_eq!(candidates.len(), 2);
        let mut seen = HashSet::new();
        for candidate in &candidates {
            for url in &candidate.urls {
                assert!(seen.insert(url.clone()), "duplicate url {url}");
            }
        }
        let pack = candidates
            .iter()
            .find(|candidate| candidate.alt_text == "wolf pack")
            .expect("srcset candidate");
        assert_eq!(pack.width, Some(800));
        assert_eq!(
            pack.urls,
            vec![
                "https://ref.test/media/b.jpg".to_string(),
                "https://ref.test/media/b.jpg?w=800".to_string(),
                "https://ref.test/media/b.jpg?w=400".to_string(),
            ]
        );
    }

    #[test]
    fn test_rank_drops_negative_url_keywords() {
        let candidates = rank(r#"<img src="/media/wolf-range-map.png" alt="Gray wolf">"#);
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_illustration_never_outranks_same_resolution_photo() {
        let candidates = rank(
            r#"<img src="/media/one.jpg" width="1000" height="700" alt="wolf illustration">
               <img src="/media/two.jpg" width="1000" height="700" alt="gray wolf in forest">"#,
        );
        assert_eq!(candidates[0].alt_text, "gray wolf in forest");
        assert!(candidates[0].score - candidates[1].score >= 3000);
    }

    #[test]
    fn test_score_is_monotonic_in_width() {
        let candidates = rank(
            r#"<img src="/media/narrow.jpg" width="500" height="400" alt="wolf">
               <img src="/media/wide.jpg" width="900" height="400" alt="wolf">"#,
        );
        assert_eq!(candidates[0].width, Some(900));
        assert!(candidates[0].score >= candidates[1].score);
    }

    #[test]
    fn test_variants_are_capped() {
        let keywords = KeywordConfig::default();
        let extractor =
            CandidateExtractor::new(&SourceConfig::default().image_selector_groups, &keywords, 2);
        let candidates = extractor.rank(
            &Html::parse_document(
                r#"<img srcset="/a.jpg?w=1 1w, /b.jpg?w=2 2w, /c.jpg?w=3 3w" alt="wolf">"#,
            ),
            BASE,
        );
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].urls.len(), 2);
    }
}
