use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use futures::FutureExt;
use gfpc_adapters::{AdapterContext, AdapterError, SourceAdapter};
use gfpc_core::{RawRecord, RunStats};
use gfpc_storage::HttpFetcher;
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};

use crate::dedup::dedupe;

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    pub max_concurrent_sources: usize,
    pub source_timeout: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sources: 10,
            source_timeout: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub source_id: String,
    pub message: String,
}

/// Deduplicated output of one successful adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceBatch {
    pub source_id: String,
    pub records: Vec<RawRecord>,
}

#[derive(Debug, Clone, Default)]
pub struct OrchestratorOutcome {
    pub batches: Vec<SourceBatch>,
    pub failures: Vec<SourceFailure>,
}

/// Run every adapter with bounded parallelism. Failures are isolated per
/// source; batches come back in adapter order.
pub async fn run_sources(
    adapters: &[Arc<dyn SourceAdapter>],
    http: &HttpFetcher,
    ctx: &AdapterContext,
    config: OrchestratorConfig,
    stats: &mut RunStats,
) -> OrchestratorOutcome {
    let runs = adapters
        .iter()
        .map(|adapter| run_source(adapter.as_ref(), http, ctx, config.source_timeout))
        .collect::<Vec<_>>();
    let results = stream::iter(runs)
        .buffered(config.max_concurrent_sources.max(1))
        .collect::<Vec<_>>()
        .await;

    let mut outcome = OrchestratorOutcome::default();
    for (source_id, result) in results {
        match result {
            Ok(records) => {
                let records = dedupe(records);
                stats.sources_processed += 1;
                stats.discovered += records.len();
                outcome.batches.push(SourceBatch { source_id, records });
            }
            Err(message) => {
                stats.errors += 1;
                outcome.failures.push(SourceFailure { source_id, message });
            }
        }
    }
    outcome
}

async fn run_source(
    adapter: &dyn SourceAdapter,
    http: &HttpFetcher,
    ctx: &AdapterContext,
    timeout: Option<Duration>,
) -> (String, Result<Vec<RawRecord>, String>) {
    let source_id = adapter.source_id().to_string();
    let span = info_span!("source_run", run_id = %ctx.run_id, source_id = %source_id);

    async move {
        let fetch = AssertUnwindSafe(adapter.fetch(http, ctx)).catch_unwind();
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, fetch).await {
                Ok(result) => flatten_fetch(result),
                Err(_) => Err(format!("timed out after {}s", limit.as_secs_f64())),
            },
            None => flatten_fetch(fetch.await),
        };
        match &result {
            Ok(records) => info!(records = records.len(), "source finished"),
            Err(message) => warn!(error = %message, "source failed"),
        }
        (source_id, result)
    }
    .instrument(span)
    .await
}

fn flatten_fetch(
    result: Result<Result<Vec<RawRecord>, AdapterError>, Box<dyn Any + Send>>,
) -> Result<Vec<RawRecord>, String> {
    match result {
        Ok(fetched) => fetched.map_err(|e| e.to_string()),
        Err(payload) => Err(format!("adapter panicked: {}", panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use gfpc_core::{product_id, NutritionalTags};
    use gfpc_storage::HttpClientConfig;
    use uuid::Uuid;

    struct FakeAdapter {
        source_id: String,
        names: Vec<&'static str>,
        fail: bool,
        delay: Duration,
    }

    impl FakeAdapter {
        fn ok(source_id: &str, names: Vec<&'static str>) -> Arc<dyn SourceAdapter> {
            Arc::new(Self {
                source_id: source_id.to_string(),
                names,
                fail: false,
                delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl SourceAdapter for FakeAdapter {
        fn source_id(&self) -> &str {
            &self.source_id
        }

        fn display_name(&self) -> &str {
            &self.source_id
        }

        async fn fetch(&self, _http: &HttpFetcher, ctx: &AdapterContext) -> Result<Vec<RawRecord>, AdapterError> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(AdapterError::Message("connection reset".to_string()));
            }
            Ok(self
                .names
                .iter()
                .map(|name| RawRecord {
                    id: product_id(name, &self.source_id),
                    name: name.to_string(),
                    source_id: self.source_id.clone(),
                    source_name: self.source_id.clone(),
                    price: 1.99,
                    original_price: None,
                    discount_percentage: 0.0,
                    url: None,
                    in_stock: true,
                    category: "Overig".to_string(),
                    brand: "Test".to_string(),
                    description: String::new(),
                    nutritional_info: NutritionalTags::default(),
                    affiliate_ready: false,
                    source_page: None,
                    discovered_at: ctx.fetched_at,
                })
                .collect())
        }
    }

    fn ctx() -> AdapterContext {
        AdapterContext {
            run_id: Uuid::new_v4(),
            fetched_at: Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap(),
        }
    }

    #[tokio::test]
    async fn one_failing_adapter_is_isolated() {
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let adapters = vec![
            FakeAdapter::ok("a", vec!["Schär Wit Brood"]),
            FakeAdapter::ok("b", vec!["Consenza Pasta", "consenza pasta"]),
            Arc::new(FakeAdapter {
                source_id: "c".to_string(),
                names: vec!["Proceli Koekjes"],
                fail: true,
                delay: Duration::ZERO,
            }) as Arc<dyn SourceAdapter>,
            FakeAdapter::ok("d", vec!["Okono Crackers"]),
            FakeAdapter::ok("e", vec!["Leev Rijstwafels"]),
        ];
        let mut stats = RunStats::new(adapters.len());

        let outcome = run_sources(&adapters, &http, &ctx(), OrchestratorConfig::default(), &mut stats).await;

        assert_eq!(stats.errors, 1);
        assert_eq!(stats.sources_processed, 4);
        assert_eq!(stats.discovered, 4);
        assert_eq!(
            outcome.batches.iter().map(|b| b.source_id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "d", "e"]
        );
        assert_eq!(outcome.batches[1].records.len(), 1);
        assert_eq!(outcome.failures[0].source_id, "c");
        assert!(outcome.failures[0].message.contains("connection reset"));
    }

    #[tokio::test]
    async fn slow_sources_hit_the_deadline() {
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let adapters = vec![
            Arc::new(FakeAdapter {
                source_id: "slow".to_string(),
                names: vec!["Schär Wit Brood"],
                fail: false,
                delay: Duration::from_secs(5),
            }) as Arc<dyn SourceAdapter>,
            FakeAdapter::ok("fast", vec!["Consenza Pasta"]),
        ];
        let mut stats = RunStats::new(adapters.len());
        let config = OrchestratorConfig {
            max_concurrent_sources: 2,
            source_timeout: Some(Duration::from_millis(50)),
        };

        let outcome = run_sources(&adapters, &http, &ctx(), config, &mut stats).await;

        assert_eq!(stats.errors, 1);
        assert_eq!(outcome.batches.len(), 1);
        assert_eq!(outcome.batches[0].source_id, "fast");
        assert!(outcome.failures[0].message.contains("timed out"));
    }

    struct PanickingAdapter;

    #[async_trait]
    impl SourceAdapter for PanickingAdapter {
        fn source_id(&self) -> &str {
            "panicky"
        }

        fn display_name(&self) -> &str {
            "Panicky"
        }

        async fn fetch(&self, _http: &HttpFetcher, _ctx: &AdapterContext) -> Result<Vec<RawRecord>, AdapterError> {
            let cards: Vec<RawRecord> = Vec::new();
            Ok(vec![cards[3].clone()])
        }
    }

    #[tokio::test]
    async fn panicking_adapter_becomes_a_failure() {
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let adapters = vec![
            FakeAdapter::ok("a", vec!["Schär Wit Brood"]),
            Arc::new(PanickingAdapter) as Arc<dyn SourceAdapter>,
            FakeAdapter::ok("b", vec!["Consenza Pasta"]),
        ];
        let mut stats = RunStats::new(adapters.len());

        let outcome = run_sources(&adapters, &http, &ctx(), OrchestratorConfig::default(), &mut stats).await;

        assert_eq!(stats.errors, 1);
        assert_eq!(stats.sources_processed, 2);
        assert_eq!(
            outcome.batches.iter().map(|b| b.source_id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert_eq!(outcome.failures[0].source_id, "panicky");
        assert!(outcome.failures[0].message.contains("adapter panicked"));
        assert!(outcome.failures[0].message.contains("index out of bounds"));
    }
}
