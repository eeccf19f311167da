//! Reference-site access: search resolution, document fetch and raw image
//! download, all routed through one fixed-delay retry wrapper.

use std::io::Read;
use std::time::Duration;

use governor::state::NotKeyed;
use governor::{Quota, RateLimiter};
use log::{debug, info, warn};
use scraper::{Html, Selector};
use url::Url;

use crate::config::SourceConfig;
use crate::document_cache::DocumentCache;
use crate::error::PipelineError;

const MAX_DOCUMENT_BYTES: u64 = 16 * 1024 * 1024;
const MAX_IMAGE_BYTES: u64 = 40 * 1024 * 1024;
const RATE_LIMIT_POLL: Duration = Duration::from_millis(20);

/// A fetched HTML document and the URL it was fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDocument {
    pub url: String,
    pub html: String,
}

impl SourceDocument {
    pub fn parse(&self) -> Html {
        Html::parse_document(&self.html)
    }
}

/// Interface the assembler drives; implemented by the live client and by test fakes.
pub trait ReferenceSource {
    /// Finds the best matching entity page for `name`.
    fn resolve_document_url(&mut self, name: &str) -> Result<String, PipelineError>;
    fn fetch_document(&mut self, url: &str) -> Result<SourceDocument, PipelineError>;
    fn download_bytes(&mut self, url: &str) -> Result<Vec<u8>, PipelineError>;
}

/// `ureq`-backed client for the reference site.
pub struct ReferenceSiteClient {
    config: SourceConfig,
    http_client: ureq::Agent,
    limiter: RateLimiter<NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>,
    cache: Option<DocumentCache>,
    refresh: bool,
}

impl ReferenceSiteClient {
    pub fn new(config: SourceConfig, cache: Option<DocumentCache>, refresh: bool) -> Self {
        let timeout = Duration::from_secs(config.timeout_secs);
        let http_client = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5).min(timeout))
            .timeout_read(timeout)
            .timeout_write(timeout)
            .user_agent(&config.user_agent)
            .build();
        let period = Duration::from_millis(config.min_request_interval_ms.max(1));
        Self {
            limiter: RateLimiter::direct(Quota::with_period(period).expect("valid limiter period")),
            config,
            http_client,
            cache,
            refresh,
        }
    }

    fn search_url(&self, name: &str) -> String {
        format!(
            "{}/search?query={}",
            self.config.base_url,
            urlencoding::encode(name.trim())
        )
    }

    fn wait_for_request_slot(&self) {
        while self.limiter.check().is_err() {
            std::thread::sleep(RATE_LIMIT_POLL);
        }
    }

    /// Runs `operation` up to `max_attempts` times with a fixed delay between
    /// attempts. Any transport failure or status >= 400 is retried.
    fn with_retries<T, F>(&self, url: &str, mut operation: F) -> Result<T, PipelineError>
    where
        F: FnMut(&Self) -> Result<T, String>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let delay = Duration::from_millis(self.config.retry_delay_ms);
        let mut attempt = 1u32;
        loop {
            self.wait_for_request_slot();
            match operation(self) {
                Ok(value) => return Ok(value),
                Err(reason) if attempt < max_attempts => {
                    debug!(
                        "Request to {} failed on attempt {}/{}: {}; retrying in {:?}",
                        url, attempt, max_attempts, reason, delay
                    );
                    std::thread::sleep(delay);
                    attempt = attempt.saturating_add(1);
                }
                Err(reason) => {
                    return Err(PipelineError::Fetch {
                        url: url.to_string(),
                        reason,
                    })
                }
            }
        }
    }

    fn get_once(&self, url: &str) -> Result<ureq::Response, String> {
        self.http_client
            .get(url)
            .call()
            .map_err(|error| match error {
                ureq::Error::Status(code, _) => format!("HTTP status {code}"),
                ureq::Error::Transport(transport) => format!("transport error: {transport}"),
            })
    }

    fn fetch_text(&mut self, url: &str) -> Result<String, PipelineError> {
        if !self.refresh {
            if let Some(cache) = &self.cache {
                match cache.get(url) {
                    Ok(Some(body)) => {
                        debug!("Document cache hit for {}", url);
                        return Ok(body);
                    }
                    Ok(None) => {}
                    Err(error) => warn!("Document cache read failed for {}: {}", url, error),
                }
            }
        }

        let raw = self.with_retries(url, |client| {
            let response = client.get_once(url)?;
            let mut raw = Vec::new();
            response
                .into_reader()
                .take(MAX_DOCUMENT_BYTES)
                .read_to_end(&mut raw)
                .map_err(|error| format!("Failed to read response: {error}"))?;
            Ok(raw)
        })?;
        let body = String::from_utf8_lossy(&raw).into_owned();

        if let Some(cache) = &self.cache {
            if let Err(error) = cache.put(url, &body) {
                warn!("Document cache write failed for {}: {}", url, error);
            }
        }
        Ok(body)
    }
}

impl ReferenceSource for ReferenceSiteClient {
    fn resolve_document_url(&mut self, name: &str) -> Result<String, PipelineError> {
        let search_url = self.search_url(name);
        let body = self.fetch_text(&search_url)?;
        let chosen = pick_document_url(&body, name, &self.config)?;
        info!("Resolved '{}' to {}", name, chosen);
        Ok(chosen)
    }

    fn fetch_document(&mut self, url: &str) -> Result<SourceDocument, PipelineError> {
        let html = self.fetch_text(url)?;
        Ok(SourceDocument {
            url: url.to_string(),
            html,
        })
    }

    fn download_bytes(&mut self, url: &str) -> Result<Vec<u8>, PipelineError> {
        self.with_retries(url, |client| {
            let response = client.get_once(url)?;
            let mut bytes = Vec::new();
            response
                .into_reader()
                .take(MAX_IMAGE_BYTES)
                .read_to_end(&mut bytes)
                .map_err(|error| format!("Image read failed: {error}"))?;
            Ok(bytes)
        })
    }
}

/// Scores every search-result link for `name` in document order.
///
/// +3 when the link text contains the name, +2 when the hyphenated name is in
/// the href, +1 when the href is under the entity prefix. When the primary
/// result list is empty, every root-relative link under a known category
/// prefix is returned with score 0.
pub fn score_search_results(html: &str, name: &str, config: &SourceConfig) -> Vec<(i32, String)> {
    let document = Html::parse_document(html);
    let name_lower = name.trim().to_lowercase();
    let hyphenated = name_lower.replace(' ', "-");
    let entity_prefix = config.entity_prefix.to_lowercase();

    let mut scored = Vec::new();
    if let Ok(result_selector) = Selector::parse(&config.search_result_selector) {
        for anchor in document.select(&result_selector) {
            let Some(href) = anchor.value().attr("href").map(str::trim) else {
                continue;
            };
            if href.is_empty() {
                continue;
            }
            let text = anchor
                .text()
                .collect::<Vec<_>>()
                .join(" ")
                .to_lowercase();
            let href_lower = href.to_lowercase();
            let mut score = 0;
            if !name_lower.is_empty() && text.contains(&name_lower) {
                score += 3;
            }
            if !hyphenated.is_empty() && href_lower.contains(&hyphenated) {
                score += 2;
            }
            if !entity_prefix.is_empty() && href_lower.contains(&entity_prefix) {
                score += 1;
            }
            scored.push((score, href.to_string()));
        }
    }

    if scored.is_empty() {
        let any_link = Selector::parse("a[href]").expect("static selector");
        for anchor in document.select(&any_link) {
            let href = anchor.value().attr("href").unwrap_or_default().trim();
            if !href.starts_with('/') {
                continue;
            }
            let href_lower = href.to_lowercase();
            if config
                .category_prefixes
                .iter()
                .any(|prefix| href_lower.contains(&prefix.to_lowercase()))
            {
                scored.push((0, href.to_string()));
            }
        }
    }
    scored
}

/// Picks the highest scoring result (first in document order on ties) and
/// resolves it against the site base URL.
pub fn pick_document_url(
    html: &str,
    name: &str,
    config: &SourceConfig,
) -> Result<String, PipelineError> {
    let mut scored = score_search_results(html, name, config);
    // Stable sort keeps document order among equal scores.
    scored.sort_by(|left, right| right.0.cmp(&left.0));
    let Some((_, href)) = scored.into_iter().next() else {
        return Err(PipelineError::NotFound {
            query: name.to_string(),
        });
    };
    join_url(&config.base_url, &href).ok_or_else(|| PipelineError::NotFound {
        query: name.to_string(),
    })
}

/// Resolves `href` against `base`; returns `None` for unparseable input.
pub fn join_url(base: &str, href: &str) -> Option<String> {
    let base = Url::parse(base).ok()?;
    base.join(href).ok().map(|joined| joined.to_string())
}

#[cfg(test)]
mod tests {
    use super::{
        join_url, pick_document_url, score_search_results, ReferenceSiteClient, ReferenceSource,
    };
    use crate::config::SourceConfig;
    use crate::document_cache::DocumentCache;
    use crate::error::PipelineError;
    use std::io::{BufRead, BufReader, Write};
    use std::net::{SocketAddr, TcpListener};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn config() -> SourceConfig {
        SourceConfig {
            base_url: "https://ref.test".to_string(),
            ..SourceConfig::default()
        }
    }

    /// Serves one scripted `(status, body)` reply per connection and counts hits.
    fn serve(replies: Vec<(u16, Vec<u8>)>) -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub server");
        let addr = listener.local_addr().expect("stub address");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        std::thread::spawn(move || {
            for (status, body) in replies {
                let Ok((stream, _)) = listener.accept() else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut reader = BufReader::new(stream);
                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line) {
                        Ok(0) | Err(_) => break,
                        Ok(_) if line == "\r\n" => break,
                        Ok(_) => {}
                    }
                }
                let mut stream = reader.into_inner();
                let head = format!(
                    "HTTP/1.1 {status} Stub\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream.write_all(head.as_bytes());
                let _ = stream.write_all(&body);
                let _ = stream.flush();
            }
        });
        (addr, hits)
    }

    fn live_config(addr: SocketAddr) -> SourceConfig {
        SourceConfig {
            base_url: format!("http://{addr}"),
            timeout_secs: 5,
            max_attempts: 3,
            retry_delay_ms: 10,
            min_request_interval_ms: 1,
            ..SourceConfig::default()
        }
    }

    fn memory_cache() -> DocumentCache {
        DocumentCache::open_in_memory(Duration::from_secs(3600)).expect("in-memory cache")
    }

    #[test]
    fn test_server_errors_are_retried_until_success() {
        let (addr, hits) = serve(vec![
            (500, b"boom".to_vec()),
            (503, b"busy".to_vec()),
            (200, b"<p>lion</p>".to_vec()),
        ]);
        let mut client = ReferenceSiteClient::new(live_config(addr), None, false);
        let url = format!("http://{addr}/animal/lion");
        let document = client.fetch_document(&url).expect("third attempt succeeds");
        assert_eq!(document.html, "<p>lion</p>");
        assert_eq!(document.url, url);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_exhausted_attempts_surface_as_fetch_error() {
        let (addr, hits) = serve(vec![
            (404, Vec::new()),
            (404, Vec::new()),
            (404, Vec::new()),
        ]);
        let mut client = ReferenceSiteClient::new(live_config(addr), None, false);
        let url = format!("http://{addr}/animal/missing");
        match client.fetch_document(&url) {
            Err(PipelineError::Fetch { url: failed, reason }) => {
                assert_eq!(failed, url);
                assert!(reason.contains("404"), "unexpected reason: {reason}");
            }
            other => panic!("expected fetch error, got {other:?}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_cached_document_skips_the_network() {
        let (addr, hits) = serve(Vec::new());
        let url = format!("http://{addr}/animal/lion");
        let cache = memory_cache();
        cache.put(&url, "<p>cached</p>").expect("seed cache");
        let mut client = ReferenceSiteClient::new(live_config(addr), Some(cache), false);
        let document = client.fetch_document(&url).expect("cache hit");
        assert_eq!(document.html, "<p>cached</p>");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_refresh_bypasses_cache_reads_but_still_writes() {
        let (addr, hits) = serve(vec![(200, b"new".to_vec())]);
        let url = format!("http://{addr}/animal/lion");
        let cache = memory_cache();
        cache.put(&url, "old").expect("seed cache");
        let mut client = ReferenceSiteClient::new(live_config(addr), Some(cache), true);
        let document = client.fetch_document(&url).expect("fresh fetch");
        assert_eq!(document.html, "new");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let stored = client
            .cache
            .as_ref()
            .expect("cache attached")
            .get(&url)
            .expect("cache read");
        assert_eq!(stored.as_deref(), Some("new"));
    }

    #[test]
    fn test_non_utf8_body_is_decoded_lossily() {
        let (addr, _hits) = serve(vec![(200, b"caf\xe9 page".to_vec())]);
        let mut client = ReferenceSiteClient::new(live_config(addr), None, false);
        let document = client
            .fetch_document(&format!("http://{addr}/animal/lion"))
            .expect("stray byte does not fail the fetch");
        assert_eq!(document.html, "caf\u{FFFD} page");
    }

    #[test]
    fn test_search_scoring_prefers_name_match_under_entity_path() {
        let html = r#"<ul>
            <li class="m-search-results__item"><a href="/topic/lion-symbol">Lion in heraldry</a></li>
            <li class="m-search-results__item"><a href="/animal/panthera-leo">Panthera leo | mammal</a></li>
            <li class="m-search-results__item"><a href="/animal/tiger">Tiger</a></li>
        </ul>"#;
        let scored = score_search_results(html, "Panthera leo", &config());
        assert_eq!(
            scored,
            vec![
                (0, "/topic/lion-symbol".to_string()),
                (6, "/animal/panthera-leo".to_string()),
                (1, "/animal/tiger".to_string()),
            ]
        );
        assert_eq!(
            pick_document_url(html, "Panthera leo", &config()).expect("should resolve"),
            "https://ref.test/animal/panthera-leo"
        );
    }

    #[test]
    fn test_search_ties_keep_document_order() {
        let html = r#"<ul>
            <li class="m-search-results__item"><a href="/animal/first">Alpha</a></li>
            <li class="m-search-results__item"><a href="/animal/second">Beta</a></li>
        </ul>"#;
        assert_eq!(
            pick_document_url(html, "gamma", &config()).expect("should resolve"),
            "https://ref.test/animal/first"
        );
    }

    #[test]
    fn test_search_falls_back_to_category_links() {
        let html = r#"<div>
            <a href="https://elsewhere.test/animal/x">external</a>
            <a href="/games/quiz">quiz</a>
            <a href="/science/coelacanth">Coelacanth</a>
        </div>"#;
        assert_eq!(
            pick_document_url(html, "Latimeria", &config()).expect("should resolve"),
            "https://ref.test/science/coelacanth"
        );
    }

    #[test]
    fn test_search_without_results_is_not_found() {
        let error = pick_document_url("<p>No results</p>", "Nessie", &config())
            .expect_err("should fail");
        assert!(error.is_not_found());
    }

    #[test]
    fn test_join_url_resolves_relative_and_absolute() {
        assert_eq!(
            join_url("https://ref.test/animal/lion", "/media/a.jpg").as_deref(),
            Some("https://ref.test/media/a.jpg")
        );
        assert_eq!(
            join_url("https://ref.test/", "//cdn.test/b.jpg").as_deref(),
            Some("https://cdn.test/b.jpg")
        );
        assert_eq!(join_url("not a url", "/x"), None);
    }
}
