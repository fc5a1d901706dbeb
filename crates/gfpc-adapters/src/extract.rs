//! Markup extraction heuristics for webshop listing pages.

use chrono::{DateTime, Utc};
use gfpc_core::{discount_percentage, is_acceptable_name, product_id, NutritionalTags, RawRecord};
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::{AdapterError, WebshopConfig};

const GLUTEN_FREE_KEYWORDS: &[&str] = &[
    "glutenvrij",
    "gluten vrij",
    "glutenfrei",
    "gluten free",
    "vrij van gluten",
    "zonder gluten",
    "ah vrij van",
    "lekker vrij",
    "schär",
    "consenza",
    "proceli",
];

const CONTAINS_GLUTEN_KEYWORDS: &[&str] = &[
    "glutenbrood",
    "met gluten",
    "gluten bevat",
    "bevat gluten",
    "niet geschikt bij gluten",
];

/// First match wins, so order matters.
const CATEGORY_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "Brood & Bakproducten",
        &["brood", "bread", "toast", "croissant", "focaccia", "baguette", "pain", "bakkerij"],
    ),
    (
        "Pasta & Rijst",
        &["pasta", "spaghetti", "penne", "fusilli", "rijst", "macaroni", "linguine", "gnocchi"],
    ),
    (
        "Koekjes & Snacks",
        &["koekje", "koekjes", "cookie", "biscuit", "snack", "cracker", "wafel"],
    ),
    (
        "Pizza & Maaltijden",
        &["pizza", "maaltijd", "ready meal", "diepvries", "magnetron", "lasagne"],
    ),
    (
        "Ontbijt & Beleg",
        &["ontbijt", "muesli", "granola", "pindakaas", "jam", "beleg", "havermout"],
    ),
    ("Chips & Crackers", &["chips", "crackers", "nacho", "tortilla", "corn"]),
    (
        "Chocolade & Snoep",
        &["chocola", "chocolate", "snoep", "candy", "lolly", "gum"],
    ),
    ("Dranken", &["drank", "bier", "sap", "thee", "coffee", "melk", "drink"]),
    (
        "Sauzen & Kruiden",
        &["saus", "sauce", "kruid", "marinade", "dressing", "mayo"],
    ),
    (
        "Bakingrediënten",
        &["meel", "flour", "bakpoeder", "gist", "suiker", "ingredient", "mix"],
    ),
    ("Diepvries", &["diepvries", "frozen", "bevroren"]),
];

pub const FALLBACK_CATEGORY: &str = "Overig";

const KNOWN_BRANDS: &[&str] = &[
    "Schär",
    "Consenza",
    "Dr. Oetker",
    "Happy Bakers",
    "Albert Heijn",
    "AH",
    "Jumbo",
    "Lays",
    "Chio",
    "Nairn's",
    "Old El Paso",
    "Prewett's",
    "Maître Mathis",
    "Proceli",
    "Turtle",
    "Leev",
    "Nutrifree",
    "Okono",
    "Miran",
    "Santiveri",
    "Le Pain des Fleurs",
    "Traindevie",
];

const SITEMAP_KEYWORDS: &[&str] = &["product", "glutenvrij", "brood", "pasta"];

pub const MAX_SITEMAP_PAGES: usize = 50;

pub fn is_gluten_free_product(name: &str) -> bool {
    let lower = name.to_lowercase();
    if CONTAINS_GLUTEN_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return false;
    }
    GLUTEN_FREE_KEYWORDS.iter().any(|k| lower.contains(k))
}

fn contains_gluten(name: &str) -> bool {
    let lower = name.to_lowercase();
    CONTAINS_GLUTEN_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Category from keywords in the product name and the page it was found on.
pub fn detect_category(name: &str, page_url: &str) -> &'static str {
    let combined = format!("{} {}", name.to_lowercase(), page_url.to_lowercase());
    CATEGORY_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| combined.contains(k)))
        .map(|(category, _)| *category)
        .unwrap_or(FALLBACK_CATEGORY)
}

pub fn extract_brand(name: &str, webshop_name: &str) -> String {
    let lower = name.to_lowercase();
    for brand in KNOWN_BRANDS {
        let needle = brand.to_lowercase();
        let found = if needle.chars().count() <= 3 {
            lower
                .split(|c: char| !c.is_alphanumeric())
                .any(|word| word == needle)
        } else {
            lower.contains(&needle)
        };
        if found {
            return (*brand).to_string();
        }
    }

    if let Some(first_word) = name.split_whitespace().next() {
        if first_word.chars().count() > 2 && first_word.chars().all(char::is_alphabetic) {
            return first_word.to_string();
        }
    }
    webshop_name.to_string()
}

pub fn nutritional_tags(name: &str) -> NutritionalTags {
    let lower = name.to_lowercase();
    let any = |words: &[&str]| words.iter().any(|w| lower.contains(w));
    NutritionalTags {
        gluten_free: true,
        organic: any(&["bio", "biologisch", "organic"]),
        vegan: any(&["vegan", "plantaardig"]),
        lactose_free: any(&["lactosevrij", "zonder lactose"]),
    }
}

fn extract_numbers(text: &str) -> Vec<f64> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut seen_dot = false;
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        if ch == '.' && !seen_dot && !current.is_empty() {
            current.push(ch);
            seen_dot = true;
            continue;
        }
        if !current.is_empty() {
            if let Ok(v) = current.parse::<f64>() {
                out.push(v);
            }
            current.clear();
            seen_dot = false;
        }
    }
    if !current.is_empty() {
        if let Ok(v) = current.parse::<f64>() {
            out.push(v);
        }
    }
    out
}

/// First amount in a price label. `,` is read as the decimal separator; when
/// one is present, `.` between digit groups (`1.234,56`) is a thousands mark.
pub fn parse_price(text: &str) -> Option<f64> {
    let normalized = if text.contains(',') {
        strip_thousands_dots(text).replace(',', ".")
    } else {
        text.to_string()
    };
    extract_numbers(&normalized).first().copied()
}

fn strip_thousands_dots(text: &str) -> String {
    let chars = text.chars().collect::<Vec<_>>();
    chars
        .iter()
        .enumerate()
        .filter(|(i, c)| {
            let grouped = **c == '.'
                && *i > 0
                && chars[i - 1].is_ascii_digit()
                && chars.len() >= i + 4
                && chars[i + 1..i + 4].iter().all(char::is_ascii_digit)
                && chars.get(i + 4).map_or(true, |next| !next.is_ascii_digit());
            !grouped
        })
        .map(|(_, c)| *c)
        .collect()
}

pub fn with_affiliate_param(url: &str, affiliate_param: Option<&str>) -> String {
    let param = affiliate_param
        .unwrap_or_default()
        .trim_start_matches(['?', '&']);
    if param.is_empty() {
        return url.to_string();
    }
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}{param}")
}

fn collapse_whitespace(text: &str) -> Option<String> {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn compile(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn first_text(card: &ElementRef<'_>, selector: &Selector) -> Option<String> {
    card.select(selector)
        .next()
        .and_then(|n| collapse_whitespace(&n.text().collect::<String>()))
}

/// Compiled selectors plus the base URL of one webshop.
#[derive(Debug)]
pub struct ListingParser<'a> {
    config: &'a WebshopConfig,
    base_url: Url,
    cards: Selector,
    name: Selector,
    price: Selector,
    original_price: Selector,
    link: Selector,
}

impl<'a> ListingParser<'a> {
    pub fn new(config: &'a WebshopConfig) -> Result<Self, AdapterError> {
        let base_url = Url::parse(&config.base_url).map_err(|e| AdapterError::BaseUrl {
            url: config.base_url.clone(),
            message: e.to_string(),
        })?;
        let selectors = &config.selectors;
        Ok(Self {
            config,
            base_url,
            cards: compile(&selectors.product_cards)?,
            name: compile(&selectors.product_name)?,
            price: compile(&selectors.product_price)?,
            original_price: compile(&selectors.original_price)?,
            link: compile(&selectors.product_link)?,
        })
    }

    pub fn parse(&self, html: &str, page_url: &str, discovered_at: DateTime<Utc>) -> Vec<RawRecord> {
        let document = Html::parse_document(html);
        document
            .select(&self.cards)
            .filter_map(|card| self.parse_card(&card, page_url, discovered_at))
            .collect()
    }

    fn accepts(&self, name: &str) -> bool {
        if !is_acceptable_name(name) {
            return false;
        }
        if self.config.dedicated_gluten_free {
            !contains_gluten(name)
        } else {
            is_gluten_free_product(name)
        }
    }

    fn parse_card(
        &self,
        card: &ElementRef<'_>,
        page_url: &str,
        discovered_at: DateTime<Utc>,
    ) -> Option<RawRecord> {
        let name = first_text(card, &self.name)?;
        if !self.accepts(&name) {
            return None;
        }

        let price = first_text(card, &self.price)
            .and_then(|t| parse_price(&t))
            .unwrap_or(0.0);
        let original_price = first_text(card, &self.original_price).and_then(|t| parse_price(&t));

        let url = card
            .select(&self.link)
            .next()
            .and_then(|a| a.value().attr("href"))
            .and_then(|href| self.base_url.join(href.trim()).ok())
            .map(|u| with_affiliate_param(u.as_str(), self.config.affiliate_param.as_deref()));

        Some(RawRecord {
            id: product_id(&name, &self.config.source_id),
            source_id: self.config.source_id.clone(),
            source_name: self.config.display_name.clone(),
            price,
            original_price,
            discount_percentage: discount_percentage(price, original_price),
            url,
            in_stock: true,
            category: detect_category(&name, page_url).to_string(),
            brand: extract_brand(&name, &self.config.display_name),
            description: format!("Glutenvrij {}", name.to_lowercase()),
            nutritional_info: nutritional_tags(&name),
            affiliate_ready: self.config.affiliate_param.is_some(),
            source_page: Some(page_url.to_string()),
            discovered_at,
            name,
        })
    }
}

/// One-shot form of [`ListingParser`].
pub fn parse_listing_html(
    config: &WebshopConfig,
    html: &str,
    page_url: &str,
    discovered_at: DateTime<Utc>,
) -> Result<Vec<RawRecord>, AdapterError> {
    Ok(ListingParser::new(config)?.parse(html, page_url, discovered_at))
}

/// Product-looking `<loc>` entries of a sitemap, capped at [`MAX_SITEMAP_PAGES`].
pub fn parse_sitemap_locs(xml: &str) -> Vec<String> {
    let document = Html::parse_document(xml);
    let Ok(loc) = Selector::parse("loc") else {
        return Vec::new();
    };
    document
        .select(&loc)
        .filter_map(|n| collapse_whitespace(&n.text().collect::<String>()))
        .filter(|url| {
            let lower = url.to_lowercase();
            SITEMAP_KEYWORDS.iter().any(|k| lower.contains(k))
        })
        .take(MAX_SITEMAP_PAGES)
        .collect()
}
