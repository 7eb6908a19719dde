//! Raw upstream product records to the listing shape served to callers.
//!
//! Everything here is pure: no I/O, no clocks, no shared state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::debug;

/// A product as served from the cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub id: u64,
    pub name: String,
    pub slug: String,
    /// Upstream product type, e.g. `booking` or `simple`.
    pub kind: String,
    pub status: String,
    pub price: Option<f64>,
    pub permalink: String,
    /// URL of the first image.
    pub image: Option<String>,
    pub categories: Vec<String>,
    pub menu_order: i64,
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    id: u64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    slug: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    price: Option<RawPrice>,
    #[serde(default)]
    permalink: String,
    #[serde(default)]
    images: Vec<RawNamed>,
    #[serde(default)]
    categories: Vec<RawNamed>,
    #[serde(default)]
    menu_order: i64,
}

/// Prices arrive as JSON numbers or as decimal strings (`""` when unset).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPrice {
    Number(f64),
    Text(String),
}

impl RawPrice {
    fn amount(&self) -> Option<f64> {
        let amount = match self {
            RawPrice::Number(n) => Some(*n),
            RawPrice::Text(s) => s.trim().parse::<f64>().ok(),
        };
        amount.filter(|n| n.is_finite())
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawNamed {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    src: Option<String>,
}

impl From<RawRecord> for NormalizedRecord {
    fn from(raw: RawRecord) -> Self {
        NormalizedRecord {
            id: raw.id,
            name: raw.name,
            slug: raw.slug,
            kind: raw.kind.unwrap_or_default(),
            status: raw.status.unwrap_or_default(),
            price: raw.price.as_ref().and_then(RawPrice::amount),
            permalink: raw.permalink,
            image: raw.images.into_iter().find_map(|image| image.src),
            categories: raw.categories.into_iter().filter_map(|c| c.name).collect(),
            menu_order: raw.menu_order,
        }
    }
}

/// Listing order. Ties are broken by ascending id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    /// Merchant-defined `menu_order`, then name.
    #[default]
    MenuOrder,
    /// Case-insensitive name.
    Name,
    /// Cheapest first; unpriced records last.
    PriceAscending,
    /// Most expensive first; unpriced records last.
    PriceDescending,
    /// Highest id first.
    Newest,
}

impl SortKey {
    fn compare(&self, a: &NormalizedRecord, b: &NormalizedRecord) -> Ordering {
        let primary = match self {
            SortKey::MenuOrder => a
                .menu_order
                .cmp(&b.menu_order)
                .then_with(|| compare_names(a, b)),
            SortKey::Name => compare_names(a, b),
            SortKey::PriceAscending => compare_prices(a.price, b.price, false),
            SortKey::PriceDescending => compare_prices(a.price, b.price, true),
            SortKey::Newest => b.id.cmp(&a.id),
        };
        primary.then_with(|| a.id.cmp(&b.id))
    }
}

fn compare_names(a: &NormalizedRecord, b: &NormalizedRecord) -> Ordering {
    a.name.to_lowercase().cmp(&b.name.to_lowercase())
}

fn compare_prices(a: Option<f64>, b: Option<f64>, descending: bool) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => {
            let ord = a.total_cmp(&b);
            if descending { ord.reverse() } else { ord }
        }
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Filters, projects, sorts and truncates raw records.
///
/// A record passes the status (or kind) filter when the filter list is
/// empty, when the record carries no such field, or when its value is
/// listed. Duplicate ids keep their first occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseShaper {
    pub statuses: Vec<String>,
    pub kinds: Vec<String>,
    pub sort: SortKey,
}

impl Default for ResponseShaper {
    /// Published records of any kind, in menu order.
    fn default() -> Self {
        Self {
            statuses: vec!["publish".to_string()],
            kinds: Vec::new(),
            sort: SortKey::default(),
        }
    }
}

impl ResponseShaper {
    pub fn with_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.kinds = kinds.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_statuses<I, S>(mut self, statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.statuses = statuses.into_iter().map(Into::into).collect();
        self
    }

    pub fn sorted_by(mut self, sort: SortKey) -> Self {
        self.sort = sort;
        self
    }

    /// Shapes `raw` records, keeping at most `limit` of them.
    pub fn shape(&self, raw: &[Value], limit: Option<usize>) -> Vec<NormalizedRecord> {
        let mut seen = HashSet::new();
        let mut records: Vec<NormalizedRecord> = raw
            .iter()
            .filter_map(|value| match RawRecord::deserialize(value) {
                Ok(record) => Some(record),
                Err(error) => {
                    debug!(%error, "skipping record that does not parse");
                    None
                }
            })
            .filter(|record| self.admits(record))
            .filter(|record| seen.insert(record.id))
            .map(NormalizedRecord::from)
            .collect();

        records.sort_by(|a, b| self.sort.compare(a, b));
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        records
    }

    fn admits(&self, record: &RawRecord) -> bool {
        matches_filter(&self.statuses, record.status.as_deref())
            && matches_filter(&self.kinds, record.kind.as_deref())
    }
}

fn matches_filter(allowed: &[String], value: Option<&str>) -> bool {
    match value {
        _ if allowed.is_empty() => true,
        None => true,
        Some(value) => allowed.iter().any(|a| a == value),
    }
}
