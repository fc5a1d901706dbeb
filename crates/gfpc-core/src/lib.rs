//! Core domain model for the gluten-free price catalog: raw listings, offers,
//! canonical products, the catalog aggregate and per-run counters.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "gfpc-core";

/// Names shorter than this (after trimming) are rejected by adapters.
pub const MIN_NAME_LEN: usize = 3;

/// Identity string shared by every listing of the same real-world product.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase, fold common Latin diacritics to their ASCII base letter and keep
/// only `[a-z0-9]`.
pub fn canonical_key(name: &str) -> CanonicalKey {
    let mut key = String::with_capacity(name.len());
    for ch in name.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            key.push(ch);
        } else if let Some(folded) = fold_diacritic(ch) {
            key.push_str(folded);
        }
    }
    CanonicalKey(key)
}

fn fold_diacritic(ch: char) -> Option<&'static str> {
    let folded = match ch {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' => "a",
        'æ' => "ae",
        'ç' | 'č' => "c",
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ě' => "e",
        'ì' | 'í' | 'î' | 'ï' => "i",
        'ñ' | 'ń' => "n",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' => "o",
        'œ' => "oe",
        'ù' | 'ú' | 'û' | 'ü' => "u",
        'ý' | 'ÿ' => "y",
        'š' => "s",
        'ž' => "z",
        'ß' => "ss",
        _ => return None,
    };
    Some(folded)
}

pub fn is_acceptable_name(name: &str) -> bool {
    name.trim().chars().count() >= MIN_NAME_LEN
}

/// Deterministic product id derived from the first listing that created it.
pub fn product_id(name: &str, source_id: &str) -> String {
    let seed = format!("{name}_{source_id}").to_lowercase();
    let uuid = Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes());
    let hex = uuid.simple().to_string();
    format!("gv_{}", &hex[..8])
}

/// Percentage saved against the crossed-out price, rounded to one decimal.
///
/// A non-positive price (blank or unparsable listing) never yields a discount.
pub fn discount_percentage(price: f64, original_price: Option<f64>) -> f64 {
    match original_price {
        Some(original) if price > 0.0 && original > price => {
            let pct = ((original - price) / original) * 100.0;
            (pct * 10.0).round() / 10.0
        }
        _ => 0.0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NutritionalTags {
    #[serde(default)]
    pub gluten_free: bool,
    #[serde(default)]
    pub organic: bool,
    #[serde(default)]
    pub vegan: bool,
    #[serde(default)]
    pub lactose_free: bool,
}

/// One listing as produced by a source adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: String,
    pub name: String,
    pub source_id: String,
    pub source_name: String,
    pub price: f64,
    pub original_price: Option<f64>,
    pub discount_percentage: f64,
    pub url: Option<String>,
    pub in_stock: bool,
    pub category: String,
    pub brand: String,
    pub description: String,
    pub nutritional_info: NutritionalTags,
    pub affiliate_ready: bool,
    pub source_page: Option<String>,
    pub discovered_at: DateTime<Utc>,
}

impl RawRecord {
    pub fn canonical_key(&self) -> CanonicalKey {
        canonical_key(&self.name)
    }
}

fn default_in_stock() -> bool {
    true
}

/// A single source's price/availability snapshot for one product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreOffer {
    pub price: f64,
    #[serde(default)]
    pub original_price: Option<f64>,
    #[serde(default)]
    pub discount_percentage: f64,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_in_stock")]
    pub in_stock: bool,
    #[serde(deserialize_with = "timestamp::deserialize")]
    pub last_updated: DateTime<Utc>,
}

impl StoreOffer {
    pub fn from_record(record: &RawRecord) -> Self {
        let discount_percentage = if record.price > 0.0 {
            record.discount_percentage
        } else {
            0.0
        };
        Self {
            price: record.price,
            original_price: record.original_price,
            discount_percentage,
            url: record.url.clone(),
            in_stock: record.in_stock,
            last_updated: record.discovered_at,
        }
    }

    pub fn has_discount(&self) -> bool {
        self.price > 0.0 && self.discount_percentage > 0.0
    }
}

/// Persisted catalog entry: shared descriptive fields plus one offer per source.
///
/// Fields this crate does not model (barcodes, images, weights written by other
/// tools) are kept in `extra` and written back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalProduct {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub brand: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub nutritional_info: NutritionalTags,
    #[serde(default)]
    pub stores: BTreeMap<String, StoreOffer>,
    #[serde(default, deserialize_with = "timestamp::deserialize_option")]
    pub last_discovered: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "timestamp::deserialize_option")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub affiliate_ready: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

impl CanonicalProduct {
    pub fn from_record(record: &RawRecord) -> Self {
        let mut stores = BTreeMap::new();
        stores.insert(record.source_id.clone(), StoreOffer::from_record(record));
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            category: record.category.clone(),
            brand: record.brand.clone(),
            description: record.description.clone(),
            nutritional_info: record.nutritional_info,
            stores,
            last_discovered: Some(record.discovered_at),
            last_updated: Some(record.discovered_at),
            affiliate_ready: record.affiliate_ready,
            extra: BTreeMap::new(),
        }
    }

    pub fn canonical_key(&self) -> CanonicalKey {
        canonical_key(&self.name)
    }

    /// Replace the source's offer wholesale and bump `last_updated`.
    pub fn upsert_offer(&mut self, source_id: &str, offer: StoreOffer) {
        self.last_updated = Some(offer.last_updated);
        self.stores.insert(source_id.to_string(), offer);
    }

    pub fn lowest_price(&self) -> Option<f64> {
        self.stores
            .values()
            .map(|offer| offer.price)
            .filter(|price| *price > 0.0)
            .fold(None, |acc: Option<f64>, price| match acc {
                Some(current) if current <= price => Some(current),
                _ => Some(price),
            })
    }

    pub fn has_discount(&self) -> bool {
        self.stores.values().any(StoreOffer::has_discount)
    }
}

/// The persisted aggregate: exactly one product per canonical key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalog {
    products: BTreeMap<CanonicalKey, CanonicalProduct>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from stored products, recomputing every key from the
    /// product name. Later products that collapse onto an existing key only
    /// contribute their offers.
    pub fn from_products(products: impl IntoIterator<Item = CanonicalProduct>) -> Self {
        let mut catalog = Self::new();
        for product in products {
            match catalog.products.entry(product.canonical_key()) {
                Entry::Vacant(slot) => {
                    slot.insert(product);
                }
                Entry::Occupied(mut slot) => {
                    slot.get_mut().stores.extend(product.stores);
                }
            }
        }
        catalog
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }

    pub fn contains_key(&self, key: &CanonicalKey) -> bool {
        self.products.contains_key(key)
    }

    pub fn get(&self, key: &CanonicalKey) -> Option<&CanonicalProduct> {
        self.products.get(key)
    }

    pub fn get_mut(&mut self, key: &CanonicalKey) -> Option<&mut CanonicalProduct> {
        self.products.get_mut(key)
    }

    pub fn insert(&mut self, key: CanonicalKey, product: CanonicalProduct) -> Option<CanonicalProduct> {
        self.products.insert(key, product)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CanonicalKey, &CanonicalProduct)> {
        self.products.iter()
    }

    pub fn products(&self) -> impl Iterator<Item = &CanonicalProduct> {
        self.products.values()
    }

    pub fn offer_count(&self) -> usize {
        self.products.values().map(|p| p.stores.len()).sum()
    }

    /// Products in persisted order: category, then name, then key.
    pub fn sorted_products(&self) -> Vec<&CanonicalProduct> {
        let mut rows = self.products.iter().collect::<Vec<_>>();
        rows.sort_by(|(ka, a), (kb, b)| {
            a.category
                .cmp(&b.category)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| ka.cmp(kb))
        });
        rows.into_iter().map(|(_, product)| product).collect()
    }
}

impl Serialize for Catalog {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.sorted_products())
    }
}

impl<'de> Deserialize<'de> for Catalog {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let products = Vec::<CanonicalProduct>::deserialize(deserializer)?;
        Ok(Self::from_products(products))
    }
}

/// Counters for one run, threaded explicitly through the pipeline stages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub discovered: usize,
    pub new: usize,
    pub updated: usize,
    pub links_validated: usize,
    pub links_fixed: usize,
    pub errors: usize,
    pub sources_processed: usize,
    pub total_sources: usize,
}

impl RunStats {
    pub fn new(total_sources: usize) -> Self {
        Self {
            total_sources,
            ..Self::default()
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_sources == 0 {
            return 0.0;
        }
        let rate = self.sources_processed as f64 / self.total_sources as f64 * 100.0;
        rate.clamp(0.0, 100.0)
    }
}

/// Stored timestamps are RFC 3339, but catalogs written by older tooling carry
/// naive ISO-8601 local times (`2025-01-15T06:00:00.123456`). Those are read as UTC.
mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{de::Error, Deserialize, Deserializer};

    pub(crate) fn parse(value: &str) -> Option<DateTime<Utc>> {
        let value = value.trim();
        if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
            return Some(parsed.with_timezone(&Utc));
        }
        ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
            .map(|naive| naive.and_utc())
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| D::Error::custom(format!("invalid timestamp `{raw}`")))
    }

    pub(crate) fn deserialize_option<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(raw) => parse(&raw)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("invalid timestamp `{raw}`"))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap()
    }

    fn record(name: &str, source_id: &str, price: f64, original: Option<f64>) -> RawRecord {
        RawRecord {
            id: product_id(name, source_id),
            name: name.to_string(),
            source_id: source_id.to_string(),
            source_name: source_id.to_string(),
            price,
            original_price: original,
            discount_percentage: discount_percentage(price, original),
            url: Some(format!("https://{source_id}.example/p")),
            in_stock: true,
            category: "Pasta & Rijst".to_string(),
            brand: "Consenza".to_string(),
            description: String::new(),
            nutritional_info: NutritionalTags::default(),
            affiliate_ready: false,
            source_page: None,
            discovered_at: ts(),
        }
    }

    #[test]
    fn canonical_key_ignores_case_punctuation_and_diacritics() {
        assert_eq!(canonical_key("Schär Wit Brood"), canonical_key("schar  wit-brood!!"));
        assert_eq!(canonical_key("Schär Wit Brood").as_str(), "scharwitbrood");
        assert_ne!(canonical_key("Consenza Pasta"), canonical_key("Schär Wit Brood"));
    }

    #[test]
    fn canonical_key_of_blank_name_is_empty() {
        assert!(canonical_key("  !! ").is_empty());
        assert!(!is_acceptable_name(" ab "));
        assert!(is_acceptable_name("abc"));
    }

    #[test]
    fn product_ids_are_deterministic() {
        let a = product_id("Consenza Pasta", "jumbo");
        assert_eq!(a, product_id("consenza pasta", "JUMBO"));
        assert_ne!(a, product_id("Consenza Pasta", "albert_heijn"));
        assert!(a.starts_with("gv_"));
        assert_eq!(a.len(), 11);
    }

    #[test]
    fn discount_is_rounded_to_one_decimal() {
        assert_eq!(discount_percentage(2.39, Some(2.99)), 20.1);
        assert_eq!(discount_percentage(2.39, None), 0.0);
        assert_eq!(discount_percentage(2.99, Some(2.39)), 0.0);
        assert_eq!(discount_percentage(0.0, Some(2.99)), 0.0);
    }

    #[test]
    fn zero_price_offer_is_not_a_discount() {
        let mut rec = record("Consenza Pasta", "jumbo", 0.0, Some(2.99));
        rec.discount_percentage = 50.0;
        let offer = StoreOffer::from_record(&rec);
        assert_eq!(offer.discount_percentage, 0.0);
        assert!(!offer.has_discount());
    }

    #[test]
    fn lowest_price_skips_blank_prices() {
        let mut product = CanonicalProduct::from_record(&record("Consenza Pasta", "a", 2.49, None));
        product.upsert_offer("b", StoreOffer::from_record(&record("Consenza Pasta", "b", 0.0, None)));
        product.upsert_offer("c", StoreOffer::from_record(&record("Consenza Pasta", "c", 2.29, None)));
        assert_eq!(product.lowest_price(), Some(2.29));
    }

    #[test]
    fn colliding_stored_products_are_folded() {
        let first = CanonicalProduct::from_record(&record("Consenza Pasta", "a", 2.49, None));
        let mut second = CanonicalProduct::from_record(&record("consenza-pasta", "b", 2.29, None));
        second.brand = "Other".to_string();
        let catalog = Catalog::from_products(vec![first, second]);

        assert_eq!(catalog.len(), 1);
        let product = catalog.get(&canonical_key("Consenza Pasta")).unwrap();
        assert_eq!(product.name, "Consenza Pasta");
        assert_eq!(product.brand, "Consenza");
        assert_eq!(product.stores.len(), 2);
    }

    #[test]
    fn catalog_serializes_sorted_and_keeps_unknown_fields() {
        let json = r#"[
          {"id":"gv_2","name":"Schär Wit Brood","category":"Brood","barcode":"8008698011256",
           "stores":{"jumbo":{"price":3.49,"url":"https://jumbo.example/schar","last_updated":"2026-03-01T06:00:00Z"}}},
          {"id":"gv_1","name":"Consenza Pasta","category":"Pasta"}
        ]"#;
        let catalog: Catalog = serde_json::from_str(json).unwrap();
        assert_eq!(catalog.len(), 2);

        let names = catalog
            .sorted_products()
            .into_iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["Schär Wit Brood", "Consenza Pasta"]);

        let bread = catalog.get(&canonical_key("schar wit brood")).unwrap();
        assert_eq!(bread.extra.get("barcode").and_then(|v| v.as_str()), Some("8008698011256"));
        assert!(bread.stores["jumbo"].in_stock);

        let first = serde_json::to_string_pretty(&catalog).unwrap();
        let reloaded: Catalog = serde_json::from_str(&first).unwrap();
        assert_eq!(reloaded, catalog);
        assert_eq!(serde_json::to_string_pretty(&reloaded).unwrap(), first);
    }

    #[test]
    fn success_rate_is_clamped() {
        let mut stats = RunStats::new(4);
        stats.sources_processed = 3;
        assert_eq!(stats.success_rate(), 75.0);
        stats.sources_processed = 9;
        assert_eq!(stats.success_rate(), 100.0);
        assert_eq!(RunStats::new(0).success_rate(), 0.0);
    }

    #[test]
    fn naive_iso_timestamps_from_older_catalogs_load_as_utc() {
        let json = r#"[{
            "id": "gv_1a2b3c4d",
            "name": "Schär Wit Brood",
            "category": "Brood & Bakproducten",
            "brand": "Schär",
            "stores": {"jumbo": {"price": 3.29, "url": "https://www.jumbo.com/schar", "last_updated": "2025-01-15T06:00:00.123456"}},
            "last_discovered": "2025-01-15T06:00:00.123456",
            "last_updated": null
        }]"#;
        let catalog: Catalog = serde_json::from_str(json).unwrap();
        let bread = catalog.get(&canonical_key("Schär Wit Brood")).unwrap();
        let expected = Utc.with_ymd_and_hms(2025, 1, 15, 6, 0, 0).single().unwrap()
            + chrono::Duration::microseconds(123_456);
        assert_eq!(bread.stores["jumbo"].last_updated, expected);
        assert_eq!(bread.last_discovered, Some(expected));
        assert_eq!(bread.last_updated, None);

        let written = serde_json::to_string(&catalog).unwrap();
        assert!(written.contains("2025-01-15T06:00:00.123456Z"));
        assert!(serde_json::from_str::<Catalog>(&written.replace("2025-01-15T06", "not-a-date")).is_err());
    }
}
