use std::collections::{BTreeMap, HashSet};

use gfpc_core::{canonical_key, CanonicalKey, CanonicalProduct, Catalog, RawRecord};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;

/// Keep the first record of every canonical key, in input order.
pub fn dedupe(records: Vec<RawRecord>) -> Vec<RawRecord> {
    let mut seen = HashSet::with_capacity(records.len());
    records
        .into_iter()
        .filter(|record| seen.insert(record.canonical_key()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NearDuplicate {
    pub category: String,
    pub canonical_key_a: CanonicalKey,
    pub canonical_key_b: CanonicalKey,
    pub name_a: String,
    pub name_b: String,
    pub confidence_score: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    pub review_threshold: f64,
    pub max_review_items: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            review_threshold: 0.93,
            max_review_items: 200,
        }
    }
}

/// Flags pairs of catalog products whose names are nearly identical but whose
/// canonical keys differ. Report-only: nothing is merged.
#[derive(Debug, Clone, Default)]
pub struct DedupEngine {
    config: DedupConfig,
}

impl DedupEngine {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    /// Word-preserving form of the canonical key, e.g. `"Schär Wit-Brood"` -> `"schar witbrood"`.
    pub fn normalize_key_fragment(input: &str) -> String {
        input
            .split_whitespace()
            .map(canonical_key)
            .filter(|k| !k.is_empty())
            .map(|k| k.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn similarity(&self, a: &CanonicalProduct, b: &CanonicalProduct) -> f64 {
        jaro_winkler(
            &Self::normalize_key_fragment(&a.name),
            &Self::normalize_key_fragment(&b.name),
        )
    }

    pub fn review(&self, catalog: &Catalog) -> Vec<NearDuplicate> {
        let mut by_category: BTreeMap<&str, Vec<(&CanonicalKey, &CanonicalProduct)>> = BTreeMap::new();
        for (key, product) in catalog.iter() {
            by_category
                .entry(product.category.as_str())
                .or_default()
                .push((key, product));
        }

        let mut items = Vec::new();
        for (category, products) in by_category {
            for i in 0..products.len() {
                for j in (i + 1)..products.len() {
                    let (key_a, a) = products[i];
                    let (key_b, b) = products[j];
                    let score = self.similarity(a, b);
                    if score >= self.config.review_threshold {
                        items.push(NearDuplicate {
                            category: category.to_string(),
                            canonical_key_a: key_a.clone(),
                            canonical_key_b: key_b.clone(),
                            name_a: a.name.clone(),
                            name_b: b.name.clone(),
                            confidence_score: score,
                        });
                    }
                }
            }
        }

        items.sort_by(|a, b| {
            b.confidence_score
                .total_cmp(&a.confidence_score)
                .then_with(|| a.canonical_key_a.cmp(&b.canonical_key_a))
                .then_with(|| a.canonical_key_b.cmp(&b.canonical_key_b))
        });
        items.truncate(self.config.max_review_items);
        items
    }
}
