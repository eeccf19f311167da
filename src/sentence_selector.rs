//! Picks descriptive sentences from an article body for the text fields.

use log::{debug, warn};
use scraper::{Html, Selector};

use crate::catalog::Seed;
use crate::config::KeywordConfig;
use crate::error::PipelineError;

const MIN_SENTENCE_CHARS: usize = 40;

/// The four descriptive fields of a record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextFields {
    pub size: String,
    pub life_expectancy: String,
    pub habitat: String,
    pub fun_fact: String,
}

impl TextFields {
    /// Fields fully supplied by the seed, when every override is present.
    pub fn from_overrides(seed: &Seed) -> Option<Self> {
        Some(Self {
            size: seed.size.clone()?,
            life_expectancy: seed.life_expectancy.clone()?,
            habitat: seed.habitat.clone()?,
            fun_fact: seed.fun_fact.clone()?,
        })
    }
}

pub struct SentenceSelector<'a> {
    paragraph_selectors: Vec<Selector>,
    keywords: &'a KeywordConfig,
}

impl<'a> SentenceSelector<'a> {
    /// `paragraph_selectors` are tried in order; the first that matches any
    /// paragraph wins.
    pub fn new(paragraph_selectors: &[String], keywords: &'a KeywordConfig) -> Self {
        let paragraph_selectors = paragraph_selectors
            .iter()
            .filter_map(|raw| match Selector::parse(raw) {
                Ok(selector) => Some(selector),
                Err(error) => {
                    warn!("Ignoring invalid paragraph selector '{}': {:?}", raw, error);
                    None
                }
            })
            .collect();
        Self {
            paragraph_selectors,
            keywords,
        }
    }

    pub fn extract_sentences(&self, document: &Html) -> Vec<String> {
        let mut sentences = Vec::new();
        for selector in &self.paragraph_selectors {
            let mut matched = false;
            for paragraph in document.select(selector) {
                matched = true;
                let text = paragraph
                    .text()
                    .flat_map(str::split_whitespace)
                    .collect::<Vec<_>>()
                    .join(" ");
                sentences.extend(split_sentences(&text));
            }
            if matched {
                break;
            }
        }
        sentences
    }

    /// Fills every field the seed does not override. Fails with `NoContent`
    /// only when a field needs the document and it yields no sentences.
    pub fn select_fields(&self, document: &Html, seed: &Seed) -> Result<TextFields, PipelineError> {
        if let Some(fields) = TextFields::from_overrides(seed) {
            debug!("All text fields overridden for {}", seed.scientific_name);
            return Ok(fields);
        }

        let sentences = self.extract_sentences(document);
        if sentences.is_empty() {
            return Err(PipelineError::NoContent {
                name: seed.scientific_name.clone(),
            });
        }
        let mut pool: Vec<&str> = sentences
            .iter()
            .map(String::as_str)
            .filter(|sentence| is_informative(sentence, &self.keywords.boilerplate_phrases))
            .collect();
        debug!(
            "{} of {} sentences informative for {}",
            pool.len(),
            sentences.len(),
            seed.scientific_name
        );

        let mut pick = |field: &Option<String>, keywords: &[String]| match field {
            Some(text) => text.clone(),
            None => take_matching(&mut pool, keywords).unwrap_or_default(),
        };
        let size = pick(&seed.size, &self.keywords.size);
        let life_expectancy = pick(&seed.life_expectancy, &self.keywords.lifespan);
        let habitat = pick(&seed.habitat, &self.keywords.habitat);
        let fun_fact = match &seed.fun_fact {
            Some(text) => text.clone(),
            None if pool.is_empty() => sentences[0].clone(),
            None => pool.remove(0).to_string(),
        };

        Ok(TextFields {
            size,
            life_expectancy,
            habitat,
            fun_fact,
        })
    }
}

/// Splits after `.`, `!` or `?` when followed by whitespace.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((index, ch)) = chars.next() {
        if !matches!(ch, '.' | '!' | '?') {
            continue;
        }
        if let Some(&(next_index, next)) = chars.peek() {
            if next.is_whitespace() {
                push_trimmed(&mut sentences, &text[start..next_index]);
                start = next_index;
            }
        } else {
            push_trimmed(&mut sentences, &text[start..index + ch.len_utf8()]);
            start = text.len();
        }
    }
    push_trimmed(&mut sentences, &text[start..]);
    sentences
}

fn push_trimmed(sentences: &mut Vec<String>, piece: &str) {
    let trimmed = piece.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
}

pub fn is_informative(sentence: &str, boilerplate_phrases: &[String]) -> bool {
    let cleaned = sentence.trim();
    if cleaned.chars().count() < MIN_SENTENCE_CHARS || cleaned.ends_with(':') {
        return false;
    }
    let lower = cleaned.to_lowercase();
    !boilerplate_phrases
        .iter()
        .any(|phrase| lower.contains(phrase.as_str()))
}

fn take_matching(pool: &mut Vec<&str>, keywords: &[String]) -> Option<String> {
    let position = pool.iter().position(|sentence| {
        let lower = sentence.to_lowercase();
        keywords.iter().any(|keyword| lower.contains(keyword.as_str()))
    })?;
    Some(pool.remove(position).to_string())
}
