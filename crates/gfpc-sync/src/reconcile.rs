use std::collections::HashSet;

use gfpc_core::{CanonicalKey, CanonicalProduct, Catalog, RunStats, StoreOffer};
use tracing::{debug, info};

use crate::orchestrator::SourceBatch;

/// Fold this run's batches into the loaded catalog.
///
/// Known products get the source's offer replaced wholesale. Unknown keys
/// create a product seeded from the record; descriptive fields are never
/// overwritten afterwards. `updated` counts each pre-existing product at most
/// once per run; a product created earlier in this merge only counts as new.
pub fn merge(existing: Catalog, batches: &[SourceBatch], stats: &mut RunStats) -> Catalog {
    let mut catalog = existing;
    let mut created: HashSet<CanonicalKey> = HashSet::new();
    let mut touched: HashSet<CanonicalKey> = HashSet::new();

    for batch in batches {
        for record in &batch.records {
            let key = record.canonical_key();
            if key.is_empty() {
                debug!(source_id = %batch.source_id, name = %record.name, "skipping record with empty key");
                continue;
            }

            match catalog.get_mut(&key) {
                Some(product) => {
                    product.upsert_offer(&record.source_id, StoreOffer::from_record(record));
                    if !created.contains(&key) && touched.insert(key) {
                        stats.updated += 1;
                    }
                }
                None => {
                    catalog.insert(key.clone(), CanonicalProduct::from_record(record));
                    created.insert(key);
                    stats.new += 1;
                }
            }
        }
    }

    info!(
        products = catalog.len(),
        new = created.len(),
        updated = touched.len(),
        "merged source batches"
    );
    catalog
}
