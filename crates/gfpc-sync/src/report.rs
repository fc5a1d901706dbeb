use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use gfpc_adapters::FALLBACK_CATEGORY;
use gfpc_core::{Catalog, RunStats};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::dedup::NearDuplicate;
use crate::orchestrator::SourceFailure;

pub const TOP_BRANDS: usize = 10;
pub const MINIMUM_PRODUCTS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistogramEntry {
    pub name: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportStatistics {
    pub total_products: usize,
    pub new_products: usize,
    pub updated_products: usize,
    pub discovered: usize,
    pub products_with_discounts: usize,
    #[serde(default)]
    pub total_offers: usize,
    /// Mean of each priced product's cheapest offer.
    #[serde(default)]
    pub average_lowest_price: f64,
    pub sources_processed: usize,
    pub total_sources: usize,
    pub success_rate: f64,
    pub links_validated: usize,
    pub links_fixed: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetAchievement {
    pub target: usize,
    pub percentage: f64,
    pub remaining: usize,
    pub minimum_reached: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub report_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub execution_time_secs: f64,
    pub statistics: ReportStatistics,
    pub category_distribution: Vec<HistogramEntry>,
    pub top_brands: Vec<HistogramEntry>,
    pub store_coverage: Vec<HistogramEntry>,
    pub target_achievement: TargetAchievement,
    #[serde(default)]
    pub failures: Vec<SourceFailure>,
    #[serde(default)]
    pub near_duplicates: Vec<NearDuplicate>,
}

pub struct ReportInput<'a> {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub catalog: &'a Catalog,
    pub stats: &'a RunStats,
    pub failures: &'a [SourceFailure],
    pub near_duplicates: &'a [NearDuplicate],
    pub target_products: usize,
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Counts per name, ordered by count descending then name ascending.
pub fn histogram<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<HistogramEntry> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for name in names {
        *counts.entry(name).or_default() += 1;
    }
    let mut entries = counts
        .into_iter()
        .map(|(name, count)| HistogramEntry {
            name: name.to_string(),
            count,
        })
        .collect::<Vec<_>>();
    entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    entries
}

pub fn target_achievement(total: usize, target: usize) -> TargetAchievement {
    let percentage = if target == 0 {
        100.0
    } else {
        round1((total as f64 / target as f64 * 100.0).min(100.0))
    };
    TargetAchievement {
        target,
        percentage,
        remaining: target.saturating_sub(total),
        minimum_reached: total >= MINIMUM_PRODUCTS,
    }
}

impl RunReport {
    pub fn build(input: ReportInput<'_>) -> Self {
        let catalog = input.catalog;
        let stats = input.stats;

        let category_distribution = histogram(catalog.products().map(|p| {
            if p.category.is_empty() {
                FALLBACK_CATEGORY
            } else {
                p.category.as_str()
            }
        }));
        let mut top_brands = histogram(
            catalog
                .products()
                .map(|p| p.brand.as_str())
                .filter(|b| !b.is_empty()),
        );
        top_brands.truncate(TOP_BRANDS);
        let store_coverage = histogram(
            catalog
                .products()
                .flat_map(|p| p.stores.keys().map(String::as_str)),
        );

        let lowest_prices = catalog.products().filter_map(|p| p.lowest_price()).collect::<Vec<_>>();
        let average_lowest_price = if lowest_prices.is_empty() {
            0.0
        } else {
            (lowest_prices.iter().sum::<f64>() / lowest_prices.len() as f64 * 100.0).round() / 100.0
        };

        let elapsed = input.finished_at - input.started_at;
        let execution_time_secs = round1(elapsed.num_milliseconds().max(0) as f64 / 1000.0);

        Self {
            run_id: input.run_id,
            report_date: input.finished_at.date_naive(),
            started_at: input.started_at,
            finished_at: input.finished_at,
            execution_time_secs,
            statistics: ReportStatistics {
                total_products: catalog.len(),
                new_products: stats.new,
                updated_products: stats.updated,
                discovered: stats.discovered,
                products_with_discounts: catalog.products().filter(|p| p.has_discount()).count(),
                total_offers: catalog.offer_count(),
                average_lowest_price,
                sources_processed: stats.sources_processed,
                total_sources: stats.total_sources,
                success_rate: round1(stats.success_rate()),
                links_validated: stats.links_validated,
                links_fixed: stats.links_fixed,
                errors: stats.errors,
            },
            category_distribution,
            top_brands,
            store_coverage,
            target_achievement: target_achievement(catalog.len(), input.target_products),
            failures: input.failures.to_vec(),
            near_duplicates: input.near_duplicates.to_vec(),
        }
    }

    pub fn file_name(&self) -> String {
        format!("daily_report_{}.json", self.report_date.format("%Y%m%d"))
    }

    pub fn render_brief(&self) -> String {
        let s = &self.statistics;
        let mut lines = vec![
            "# Gluten-Free Price Catalog Daily Brief".to_string(),
            String::new(),
            format!("- Run ID: `{}`", self.run_id),
            format!("- Started: {}", self.started_at.to_rfc3339()),
            format!("- Finished: {}", self.finished_at.to_rfc3339()),
            format!("- Execution time: {}s", self.execution_time_secs),
            format!(
                "- Products: {} ({} new, {} updated, {} discovered)",
                s.total_products, s.new_products, s.updated_products, s.discovered
            ),
            format!("- With discount: {}", s.products_with_discounts),
            format!(
                "- Offers: {} (average cheapest price EUR {:.2})",
                s.total_offers, s.average_lowest_price
            ),
            format!(
                "- Sources: {}/{} ({}%)",
                s.sources_processed, s.total_sources, s.success_rate
            ),
            format!("- Links: {} validated, {} fixed", s.links_validated, s.links_fixed),
            format!("- Errors: {}", s.errors),
            format!(
                "- Target: {}% of {} ({} remaining)",
                self.target_achievement.percentage,
                self.target_achievement.target,
                self.target_achievement.remaining
            ),
            String::new(),
        ];

        let mut section = |title: &str, entries: &[HistogramEntry]| {
            lines.push(format!("## {title}"));
            lines.extend(entries.iter().map(|e| format!("- {}: {}", e.name, e.count)));
            lines.push(String::new());
        };
        section("Categories", &self.category_distribution);
        section("Top Brands", &self.top_brands);
        section("Store Coverage", &self.store_coverage);

        if !self.failures.is_empty() {
            lines.push("## Source Failures".to_string());
            lines.extend(
                self.failures
                    .iter()
                    .map(|f| format!("- {}: {}", f.source_id, f.message)),
            );
            lines.push(String::new());
        }
        if !self.near_duplicates.is_empty() {
            lines.push("## Near-Duplicate Review".to_string());
            lines.extend(self.near_duplicates.iter().map(|d| {
                format!(
                    "- {} / {} ({:.3}, {})",
                    d.name_a, d.name_b, d.confidence_score, d.category
                )
            }));
            lines.push(String::new());
        }
        lines.join("\n")
    }
}

#[derive(Debug, Clone)]
pub struct WrittenReport {
    pub dir: PathBuf,
    pub json_path: PathBuf,
    pub brief_path: PathBuf,
}

pub async fn write_report(reports_root: &Path, report: &RunReport) -> Result<WrittenReport> {
    let dir = reports_root.join(report.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let json_path = dir.join(report.file_name());
    let json = serde_json::to_vec_pretty(report).context("serializing run report")?;
    fs::write(&json_path, json)
        .await
        .with_context(|| format!("writing {}", json_path.display()))?;

    let brief_path = dir.join("daily_brief.md");
    fs::write(&brief_path, report.render_brief())
        .await
        .with_context(|| format!("writing {}", brief_path.display()))?;

    Ok(WrittenReport {
        dir,
        json_path,
        brief_path,
    })
}

fn read_run_report(dir: &Path) -> Result<Option<RunReport>> {
    let entries = std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))?;
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with("daily_report_") && name.ends_with(".json") {
            let path = entry.path();
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let report = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            return Ok(Some(report));
        }
    }
    Ok(None)
}

/// Markdown summary of the most recent `runs` reports under `reports_root`.
pub fn report_daily_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut reports = Vec::new();
    for entry in std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
    {
        if let Some(report) = read_run_report(&entry.path())? {
            reports.push((entry.path(), report));
        }
    }
    reports.sort_by(|(_, a), (_, b)| b.finished_at.cmp(&a.finished_at));

    let mut lines = vec!["# Gluten-Free Price Catalog Report".to_string(), String::new()];
    for (dir, report) in reports.into_iter().take(runs.max(1)) {
        let s = &report.statistics;
        lines.push(format!("## Run `{}` ({})", report.run_id, report.report_date));
        lines.push(format!(
            "- products: {} ({} new, {} updated)",
            s.total_products, s.new_products, s.updated_products
        ));
        lines.push(format!(
            "- sources: {}/{}, errors: {}",
            s.sources_processed, s.total_sources, s.errors
        ));
        lines.push(format!("- links: {} valid, {} fixed", s.links_validated, s.links_fixed));
        lines.push(format!("- target: {}%", report.target_achievement.percentage));
        lines.push(format!("- report: `{}`", dir.join(report.file_name()).display()));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use gfpc_core::{discount_percentage, product_id, NutritionalTags, RawRecord};
    use tempfile::tempdir;

    fn record(name: &str, source_id: &str, category: &str, brand: &str, original: Option<f64>) -> RawRecord {
        RawRecord {
            id: product_id(name, source_id),
            name: name.to_string(),
            source_id: source_id.to_string(),
            source_name: source_id.to_string(),
            price: 2.0,
            original_price: original,
            discount_percentage: discount_percentage(2.0, original),
            url: None,
            in_stock: true,
            category: category.to_string(),
            brand: brand.to_string(),
            description: String::new(),
            nutritional_info: NutritionalTags::default(),
            affiliate_ready: false,
            source_page: None,
            discovered_at: Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap(),
        }
    }

    fn sample_report(run_offset_hours: i64) -> RunReport {
        let mut products = vec![
            gfpc_core::CanonicalProduct::from_record(&record("Schär Wit Brood", "jumbo", "Brood", "Schär", None)),
            gfpc_core::CanonicalProduct::from_record(&record("Schär Ciabatta", "plus", "Brood", "Schär", Some(2.5))),
            gfpc_core::CanonicalProduct::from_record(&record("Consenza Pasta", "jumbo", "Pasta", "Consenza", None)),
            gfpc_core::CanonicalProduct::from_record(&record("Proceli Koekjes", "jumbo", "", "", None)),
        ];
        let mut plus_offer = products[1].stores["plus"].clone();
        plus_offer.price = 1.5;
        products[0].stores.insert("plus".to_string(), plus_offer);
        let catalog = Catalog::from_products(products);
        let mut stats = RunStats::new(3);
        stats.sources_processed = 2;
        stats.new = 4;
        stats.errors = 1;
        let started_at = Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap()
            + Duration::hours(run_offset_hours);
        RunReport::build(ReportInput {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: started_at + Duration::milliseconds(12_340),
            catalog: &catalog,
            stats: &stats,
            failures: &[SourceFailure {
                source_id: "ah".to_string(),
                message: "timed out".to_string(),
            }],
            near_duplicates: &[],
            target_products: 2500,
        })
    }

    #[test]
    fn histograms_sort_by_count_then_name() {
        let entries = histogram(["b", "a", "c", "b", "c"]);
        let flat = entries.iter().map(|e| (e.name.as_str(), e.count)).collect::<Vec<_>>();
        assert_eq!(flat, vec![("b", 2), ("c", 2), ("a", 1)]);
    }

    #[test]
    fn target_achievement_is_capped() {
        let t = target_achievement(1250, 2500);
        assert_eq!((t.percentage, t.remaining, t.minimum_reached), (50.0, 1250, true));
        let t = target_achievement(3000, 2500);
        assert_eq!((t.percentage, t.remaining), (100.0, 0));
        assert!(!target_achievement(99, 2500).minimum_reached);
        assert_eq!(target_achievement(1, 3).percentage, 33.3);
    }

    #[test]
    fn report_aggregates_catalog_and_stats() {
        let report = sample_report(0);
        let s = &report.statistics;
        assert_eq!(s.total_products, 4);
        assert_eq!(s.products_with_discounts, 2);
        assert_eq!(s.total_offers, 5);
        assert_eq!(s.average_lowest_price, 1.88);
        assert_eq!(s.success_rate, 66.7);
        assert_eq!(report.execution_time_secs, 12.3);
        assert_eq!(report.file_name(), "daily_report_20260301.json");
        assert_eq!(
            report.category_distribution,
            vec![
                HistogramEntry { name: "Brood".to_string(), count: 2 },
                HistogramEntry { name: "Overig".to_string(), count: 1 },
                HistogramEntry { name: "Pasta".to_string(), count: 1 },
            ]
        );
        assert_eq!(report.top_brands[0], HistogramEntry { name: "Schär".to_string(), count: 2 });
        assert_eq!(report.top_brands.len(), 2);
        assert_eq!(
            report.store_coverage,
            vec![
                HistogramEntry { name: "jumbo".to_string(), count: 3 },
                HistogramEntry { name: "plus".to_string(), count: 2 },
            ]
        );
        let brief = report.render_brief();
        assert!(brief.contains("- Sources: 2/3 (66.7%)"));
        assert!(brief.contains("- Offers: 5 (average cheapest price EUR 1.88)"));
        assert!(brief.contains("## Source Failures\n- ah: timed out"));
    }

    #[tokio::test]
    async fn written_reports_are_summarized_newest_first() {
        let dir = tempdir().unwrap();
        let older = sample_report(0);
        let newer = sample_report(24);
        let written = write_report(dir.path(), &older).await.unwrap();
        write_report(dir.path(), &newer).await.unwrap();

        assert!(written.brief_path.exists());
        assert!(written.json_path.ends_with("daily_report_20260301.json"));

        let markdown = report_daily_markdown(1, dir.path()).unwrap();
        assert!(markdown.contains(&newer.run_id.to_string()));
        assert!(!markdown.contains(&older.run_id.to_string()));

        let both = report_daily_markdown(5, dir.path()).unwrap();
        let newer_at = both.find(&newer.run_id.to_string()).unwrap();
        let older_at = both.find(&older.run_id.to_string()).unwrap();
        assert!(newer_at < older_at);
    }
}
