use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use gfpc_adapters::LinkRepairRule;
use gfpc_core::{canonical_key, CanonicalKey, Catalog, RunStats};
use gfpc_storage::HttpFetcher;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Valid,
    Unreachable,
}

#[async_trait]
pub trait LinkProbe: Send + Sync {
    async fn check(&self, url: &str) -> ProbeOutcome;
}

#[async_trait]
impl LinkProbe for HttpFetcher {
    async fn check(&self, url: &str) -> ProbeOutcome {
        match self.probe(url).await {
            Ok(status) if status.is_success() || status.is_redirection() => ProbeOutcome::Valid,
            Ok(status) => {
                debug!(url, %status, "link probe rejected");
                ProbeOutcome::Unreachable
            }
            Err(err) => {
                debug!(url, error = %err, "link probe failed");
                ProbeOutcome::Unreachable
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LinkValidatorConfig {
    pub max_concurrent_probes: usize,
    pub probe_delay: Duration,
}

impl Default for LinkValidatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_probes: 8,
            probe_delay: Duration::from_millis(100),
        }
    }
}

/// `"Schär Wit Brood"` -> `"schar-wit-brood"`.
pub fn slugify(name: &str) -> String {
    name.split_whitespace()
        .map(canonical_key)
        .filter(|k| !k.is_empty())
        .map(|k| k.to_string())
        .collect::<Vec<_>>()
        .join("-")
}

/// Deterministic fix-up for a URL that failed its probe. Returns the input
/// unchanged when the rule does not apply.
pub fn repair_url(rule: LinkRepairRule, url: &str, product_name: &str) -> String {
    match rule {
        LinkRepairRule::AppendHtmlSlug => {
            let slug = slugify(product_name);
            if url.ends_with(".html") || slug.is_empty() {
                return url.to_string();
            }
            let base = url.split('?').next().unwrap_or(url).trim_end_matches('/');
            format!("{base}/{slug}.html")
        }
    }
}

struct LinkTarget {
    key: CanonicalKey,
    source_id: String,
    url: String,
}

async fn check_target(probe: &dyn LinkProbe, target: LinkTarget, delay: Duration) -> (LinkTarget, ProbeOutcome) {
    tokio::time::sleep(delay).await;
    let outcome = probe.check(&target.url).await;
    (target, outcome)
}

/// Probe every offer URL and apply the owning source's repair rule to the
/// unreachable ones. Offers without a URL are skipped.
pub async fn validate_links(
    catalog: &mut Catalog,
    repair_rules: &HashMap<String, LinkRepairRule>,
    probe: &dyn LinkProbe,
    config: LinkValidatorConfig,
    stats: &mut RunStats,
) {
    let targets = catalog
        .iter()
        .flat_map(|(key, product)| {
            product.stores.iter().filter_map(move |(source_id, offer)| {
                offer
                    .url
                    .as_deref()
                    .filter(|url| !url.is_empty())
                    .map(|url| LinkTarget {
                        key: key.clone(),
                        source_id: source_id.clone(),
                        url: url.to_string(),
                    })
            })
        })
        .collect::<Vec<_>>();

    let checks = targets
        .into_iter()
        .map(|target| check_target(probe, target, config.probe_delay))
        .collect::<Vec<_>>();
    let probed = stream::iter(checks)
        .buffer_unordered(config.max_concurrent_probes.max(1))
        .collect::<Vec<_>>()
        .await;

    let mut unreachable = 0usize;
    for (target, outcome) in probed {
        if outcome == ProbeOutcome::Valid {
            stats.links_validated += 1;
            continue;
        }
        unreachable += 1;
        let Some(rule) = repair_rules.get(&target.source_id) else {
            continue;
        };
        let Some(product) = catalog.get_mut(&target.key) else {
            continue;
        };
        let repaired = repair_url(*rule, &target.url, &product.name);
        if repaired == target.url {
            continue;
        }
        if let Some(offer) = product.stores.get_mut(&target.source_id) {
            debug!(source_id = %target.source_id, from = %target.url, to = %repaired, "repaired link");
            offer.url = Some(repaired);
            stats.links_fixed += 1;
        }
    }

    info!(
        validated = stats.links_validated,
        unreachable,
        fixed = stats.links_fixed,
        "link validation finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use gfpc_core::{product_id, CanonicalProduct, NutritionalTags, RawRecord, StoreOffer};
    use std::collections::HashSet;
    use std::sync::Mutex;

    struct FakeProbe {
        broken: HashSet<String>,
        seen: Mutex<Vec<String>>,
    }

    impl FakeProbe {
        fn new(broken: &[&str]) -> Self {
            Self {
                broken: broken.iter().map(|s| s.to_string()).collect(),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LinkProbe for FakeProbe {
        async fn check(&self, url: &str) -> ProbeOutcome {
            self.seen.lock().unwrap().push(url.to_string());
            if self.broken.contains(url) {
                ProbeOutcome::Unreachable
            } else {
                ProbeOutcome::Valid
            }
        }
    }

    fn product(name: &str, offers: &[(&str, Option<&str>)]) -> CanonicalProduct {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap();
        let mut p = CanonicalProduct::from_record(&RawRecord {
            id: product_id(name, offers[0].0),
            name: name.to_string(),
            source_id: offers[0].0.to_string(),
            source_name: offers[0].0.to_string(),
            price: 2.0,
            original_price: None,
            discount_percentage: 0.0,
            url: offers[0].1.map(str::to_string),
            in_stock: true,
            category: "Overig".to_string(),
            brand: "Test".to_string(),
            description: String::new(),
            nutritional_info: NutritionalTags::default(),
            affiliate_ready: false,
            source_page: None,
            discovered_at: at,
        });
        for (source_id, url) in &offers[1..] {
            p.upsert_offer(
                source_id,
                StoreOffer {
                    price: 2.0,
                    original_price: None,
                    discount_percentage: 0.0,
                    url: url.map(str::to_string),
                    in_stock: true,
                    last_updated: at,
                },
            );
        }
        p
    }

    fn rules() -> HashMap<String, LinkRepairRule> {
        HashMap::from([("glutenvrije_webshop".to_string(), LinkRepairRule::AppendHtmlSlug)])
    }

    fn fast() -> LinkValidatorConfig {
        LinkValidatorConfig {
            max_concurrent_probes: 4,
            probe_delay: Duration::ZERO,
        }
    }

    #[test]
    fn repair_appends_slug_and_strips_query() {
        let rule = LinkRepairRule::AppendHtmlSlug;
        let url = "https://www.glutenvrijewebshop.nl/brood/?ref=glutenvergelijker";
        let repaired = repair_url(rule, url, "Schär Wit Brood");
        assert_eq!(repaired, "https://www.glutenvrijewebshop.nl/brood/schar-wit-brood.html");
        assert_eq!(repair_url(rule, url, "Schär Wit Brood"), repaired);
        assert_eq!(repair_url(rule, &repaired, "Schär Wit Brood"), repaired);
        assert_eq!(repair_url(rule, url, "!!!"), url);
    }

    #[tokio::test]
    async fn unreachable_links_are_repaired_only_when_a_rule_applies() {
        let mut catalog = Catalog::from_products(vec![
            product(
                "Schär Wit Brood",
                &[
                    ("glutenvrije_webshop", Some("https://www.glutenvrijewebshop.nl/brood")),
                    ("jumbo", Some("https://www.jumbo.com/broken")),
                ],
            ),
            product("Consenza Pasta", &[("glutenvrije_webshop", Some("https://www.glutenvrijewebshop.nl/pasta.html"))]),
            product("Proceli Koekjes", &[("plus", None)]),
        ]);
        let probe = FakeProbe::new(&[
            "https://www.glutenvrijewebshop.nl/brood",
            "https://www.jumbo.com/broken",
            "https://www.glutenvrijewebshop.nl/pasta.html",
        ]);
        let mut stats = RunStats::new(3);

        validate_links(&mut catalog, &rules(), &probe, fast(), &mut stats).await;

        assert_eq!(stats.links_validated, 0);
        assert_eq!(stats.links_fixed, 1);
        assert_eq!(probe.seen.lock().unwrap().len(), 3);
        let bread = catalog.get(&canonical_key("Schär Wit Brood")).unwrap();
        assert_eq!(
            bread.stores["glutenvrije_webshop"].url.as_deref(),
            Some("https://www.glutenvrijewebshop.nl/brood/schar-wit-brood.html")
        );
        assert_eq!(bread.stores["jumbo"].url.as_deref(), Some("https://www.jumbo.com/broken"));
        let pasta = catalog.get(&canonical_key("Consenza Pasta")).unwrap();
        assert_eq!(
            pasta.stores["glutenvrije_webshop"].url.as_deref(),
            Some("https://www.glutenvrijewebshop.nl/pasta.html")
        );
        assert_eq!(catalog.len(), 3);
    }

    #[tokio::test]
    async fn valid_links_are_left_alone() {
        let mut catalog = Catalog::from_products(vec![product(
            "Schär Wit Brood",
            &[("glutenvrije_webshop", Some("https://www.glutenvrijewebshop.nl/brood"))],
        )]);
        let before = catalog.clone();
        let mut stats = RunStats::new(1);
        validate_links(&mut catalog, &rules(), &FakeProbe::new(&[]), fast(), &mut stats).await;
        assert_eq!(catalog, before);
        assert_eq!((stats.links_validated, stats.links_fixed), (1, 0));
    }

    #[tokio::test]
    async fn broken_links_without_a_rule_are_not_counted_as_valid() {
        let mut catalog = Catalog::from_products(vec![
            product("Okono Crackers", &[("jumbo", Some("https://www.jumbo.com/gone"))]),
            product("Leev Rijstwafels", &[("jumbo", Some("https://www.jumbo.com/leev"))]),
        ]);
        let mut stats = RunStats::new(1);

        validate_links(
            &mut catalog,
            &HashMap::new(),
            &FakeProbe::new(&["https://www.jumbo.com/gone"]),
            fast(),
            &mut stats,
        )
        .await;

        assert_eq!((stats.links_validated, stats.links_fixed), (1, 0));
    }
}
