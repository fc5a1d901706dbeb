//! Source adapter contract and the selector-driven webshop adapter.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gfpc_core::RawRecord;
use gfpc_storage::HttpFetcher;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

mod extract;

pub use extract::{
    detect_category, extract_brand, is_gluten_free_product, nutritional_tags, parse_listing_html,
    parse_price, parse_sitemap_locs, with_affiliate_param, ListingParser, FALLBACK_CATEGORY,
    MAX_SITEMAP_PAGES,
};

pub const CRATE_NAME: &str = "gfpc-adapters";

pub const DEFAULT_SEARCH_PAGES: u32 = 20;
pub const DEFAULT_CATEGORY_PAGES: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            fetched_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector {selector:?}: {message}")]
    Selector { selector: String, message: String },
    #[error("invalid base url {url:?}: {message}")]
    BaseUrl { url: String, message: String },
    #[error("{source_id} unreachable: all {attempts} page requests failed (last error: {last_error})")]
    SourceUnreachable {
        source_id: String,
        attempts: usize,
        last_error: String,
    },
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// One retailer. Implementations return everything they found in a single
/// batch; deduplication and merging happen downstream.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn display_name(&self) -> &str;

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawRecord>, AdapterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkRepairRule {
    /// Append `/{slug}.html` to product URLs that do not end in `.html`.
    AppendHtmlSlug,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub product_cards: String,
    pub product_name: String,
    pub product_price: String,
    pub original_price: String,
    pub product_link: String,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            product_cards: ".product-item, .product-card, .product-tile".to_string(),
            product_name: ".product-name, .product-title, h2, h3".to_string(),
            product_price: ".price, .product-price".to_string(),
            original_price: ".old-price, .original-price, .was-price".to_string(),
            product_link: "a".to_string(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_rate_limit_secs() -> f64 {
    1.0
}

/// One entry of `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebshopConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub base_url: String,
    #[serde(default)]
    pub search_endpoints: Vec<String>,
    #[serde(default)]
    pub category_urls: Vec<String>,
    #[serde(default = "default_true")]
    pub sitemap: bool,
    /// Every listing on this shop is gluten-free, so names need no keyword.
    #[serde(default)]
    pub dedicated_gluten_free: bool,
    #[serde(default)]
    pub selectors: SelectorConfig,
    #[serde(default = "default_rate_limit_secs")]
    pub rate_limit_secs: f64,
    #[serde(default)]
    pub max_pages: Option<u32>,
    #[serde(default)]
    pub affiliate_param: Option<String>,
    #[serde(default)]
    pub link_repair: Option<LinkRepairRule>,
}

impl WebshopConfig {
    pub fn pacing(&self) -> Duration {
        if self.rate_limit_secs.is_finite() && self.rate_limit_secs > 0.0 {
            Duration::from_secs_f64(self.rate_limit_secs)
        } else {
            Duration::ZERO
        }
    }

    pub fn endpoint_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    pub fn sitemap_url(&self) -> String {
        self.endpoint_url("/sitemap.xml")
    }
}

pub fn paged_url(url: &str, page: u32) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}page={page}")
}

#[derive(Debug, Default)]
struct Crawl {
    attempts: usize,
    successes: usize,
    last_error: Option<String>,
    records: Vec<RawRecord>,
}

impl Crawl {
    fn failed(&mut self, error: String) {
        self.attempts += 1;
        self.last_error = Some(error);
    }

    fn succeeded(&mut self) {
        self.attempts += 1;
        self.successes += 1;
    }
}

/// Crawls search pages, category pages and the sitemap of one webshop.
#[derive(Debug, Clone)]
pub struct WebshopAdapter {
    config: WebshopConfig,
}

impl WebshopAdapter {
    pub fn new(config: WebshopConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WebshopConfig {
        &self.config
    }

    async fn fetch_page(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        url: &str,
        crawl: &mut Crawl,
    ) -> Option<String> {
        match http.fetch_bytes(ctx.run_id, &self.config.source_id, url).await {
            Ok(resp) => {
                crawl.succeeded();
                Some(resp.text())
            }
            Err(err) => {
                warn!(source_id = %self.config.source_id, url, error = %err, "page fetch failed");
                crawl.failed(err.to_string());
                None
            }
        }
    }

    /// Follows `?page=N` until a page fails, yields nothing, or `max_pages` is hit.
    async fn crawl_listing(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        parser: &ListingParser<'_>,
        start_url: &str,
        max_pages: u32,
        crawl: &mut Crawl,
    ) {
        for page in 1..=max_pages {
            let url = paged_url(start_url, page);
            let Some(html) = self.fetch_page(http, ctx, &url, crawl).await else {
                break;
            };
            let records = parser.parse(&html, &url, ctx.fetched_at);
            debug!(source_id = %self.config.source_id, url, found = records.len(), "parsed listing page");
            if records.is_empty() {
                break;
            }
            crawl.records.extend(records);
            tokio::time::sleep(self.config.pacing()).await;
        }
    }

    async fn crawl_sitemap(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        parser: &ListingParser<'_>,
        crawl: &mut Crawl,
    ) {
        let sitemap_url = self.config.sitemap_url();
        let Some(xml) = self.fetch_page(http, ctx, &sitemap_url, crawl).await else {
            return;
        };
        for url in parse_sitemap_locs(&xml) {
            if let Some(html) = self.fetch_page(http, ctx, &url, crawl).await {
                crawl.records.extend(parser.parse(&html, &url, ctx.fetched_at));
            }
            tokio::time::sleep(self.config.pacing()).await;
        }
    }
}

#[async_trait]
impl SourceAdapter for WebshopAdapter {
    fn source_id(&self) -> &str {
        &self.config.source_id
    }

    fn display_name(&self) -> &str {
        &self.config.display_name
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let parser = ListingParser::new(&self.config)?;
        let mut crawl = Crawl::default();

        let search_pages = self.config.max_pages.unwrap_or(DEFAULT_SEARCH_PAGES);
        for endpoint in &self.config.search_endpoints {
            let url = self.config.endpoint_url(endpoint);
            self.crawl_listing(http, ctx, &parser, &url, search_pages, &mut crawl)
                .await;
        }

        let category_pages = self.config.max_pages.unwrap_or(DEFAULT_CATEGORY_PAGES);
        for category in &self.config.category_urls {
            let url = self.config.endpoint_url(category);
            self.crawl_listing(http, ctx, &parser, &url, category_pages, &mut crawl)
                .await;
        }

        if self.config.sitemap {
            self.crawl_sitemap(http, ctx, &parser, &mut crawl)
                .await;
        }

        if crawl.attempts > 0 && crawl.successes == 0 {
            return Err(AdapterError::SourceUnreachable {
                source_id: self.config.source_id.clone(),
                attempts: crawl.attempts,
                last_error: crawl.last_error.unwrap_or_default(),
            });
        }

        info!(
            source_id = %self.config.source_id,
            pages = crawl.successes,
            records = crawl.records.len(),
            "webshop crawl finished"
        );
        Ok(crawl.records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sources_yaml_entry_fills_defaults() {
        let yaml = r#"
source_id: glutenvrije_webshop
display_name: Glutenvrije Webshop
base_url: https://www.glutenvrijewebshop.nl/
category_urls: ["/brood-bakproducten"]
link_repair: append_html_slug
selectors:
  product_cards: ".product"
"#;
        let cfg: WebshopConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(cfg.enabled);
        assert!(cfg.sitemap);
        assert_eq!(cfg.link_repair, Some(LinkRepairRule::AppendHtmlSlug));
        assert_eq!(cfg.selectors.product_cards, ".product");
        assert_eq!(cfg.selectors.product_link, "a");
        assert_eq!(cfg.pacing(), Duration::from_secs(1));
        assert_eq!(
            cfg.endpoint_url("/brood-bakproducten"),
            "https://www.glutenvrijewebshop.nl/brood-bakproducten"
        );
        assert_eq!(cfg.sitemap_url(), "https://www.glutenvrijewebshop.nl/sitemap.xml");
    }

    #[test]
    fn pages_are_appended_to_existing_queries() {
        assert_eq!(paged_url("https://a.nl/zoeken?q=glutenvrij", 2), "https://a.nl/zoeken?q=glutenvrij&page=2");
        assert_eq!(paged_url("https://a.nl/brood", 1), "https://a.nl/brood?page=1");
    }

    #[test]
    fn non_positive_rate_limit_means_no_pacing() {
        let mut cfg: WebshopConfig = serde_json::from_value(serde_json::json!({
            "source_id": "jumbo",
            "display_name": "Jumbo",
            "base_url": "https://www.jumbo.com",
            "rate_limit_secs": -1.0
        }))
        .unwrap();
        assert_eq!(cfg.pacing(), Duration::ZERO);
        cfg.rate_limit_secs = 0.25;
        assert_eq!(cfg.pacing(), Duration::from_millis(250));
    }
}
