//! Universe State
//!
//! Market revision maps and the per-market security index built during
//! bootstrap, plus the read-only snapshot the pool shares with callers.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::domain::mapping::MappedObject;
use crate::domain::record::FieldValue;
use crate::domain::schema::SchemaRegistry;

/// Qualified name of the market shape.
pub const MARKET_QUALIFIED_NAME: &str = "global::Market";

/// Markets keyed by market code.
pub type MarketMap = BTreeMap<String, MarketRevisionEntry>;

/// One market's data shapes and their current revisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarketRevisionEntry {
    /// Market code, e.g. `DCE`.
    pub market: String,
    /// Namespace the market record came from.
    pub namespace: u32,
    /// Human-readable market name.
    pub display_name: String,
    /// Current trade day as `YYYYMMDD`.
    pub trade_day: i32,
    /// Qualified name to revision.
    pub revisions: BTreeMap<String, u32>,
}

impl MarketRevisionEntry {
    /// Read a mapped market record.
    ///
    /// The qualified-name and revision vectors are zipped; trailing
    /// elements of the longer one are ignored. Returns `None` when the
    /// record has no market code.
    #[must_use]
    pub fn from_object(namespace: u32, object: &MappedObject) -> Option<Self> {
        if object.code.is_empty() {
            return None;
        }
        let trade_day = match object.get("trade_day") {
            Some(FieldValue::Int32(day)) => *day,
            _ => 0,
        };
        let display_name = match object.get("name") {
            Some(FieldValue::String(name)) => name.clone(),
            _ => object.code.clone(),
        };
        let revisions = match (object.get("qualified_names"), object.get("revisions")) {
            (Some(FieldValue::StringVector(names)), Some(FieldValue::Int32Vector(revs))) => names
                .iter()
                .zip(revs)
                .filter_map(|(name, rev)| u32::try_from(*rev).ok().map(|r| (name.clone(), r)))
                .collect(),
            _ => BTreeMap::new(),
        };
        Some(Self {
            market: object.code.clone(),
            namespace,
            display_name,
            trade_day,
            revisions,
        })
    }
}

/// One instrument known for a market.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SecurityEntry {
    /// Market code.
    pub market: String,
    /// Shape the entry came from.
    pub qualified_name: String,
    /// Instrument code.
    pub code: String,
    /// Attribute values.
    pub fields: BTreeMap<String, Value>,
}

/// Instruments grouped by market.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SecurityIndex {
    by_market: HashMap<String, Vec<SecurityEntry>>,
}

impl SecurityIndex {
    /// Make sure `market` has a (possibly empty) bucket.
    pub fn ensure_market(&mut self, market: &str) {
        self.by_market.entry(market.to_string()).or_default();
    }

    /// Add the entries carried by one seeds record.
    ///
    /// Security-list shapes are exploded into one entry per vector element;
    /// any other shape becomes a single entry. Returns the number added.
    pub fn ingest(&mut self, market: &str, object: &MappedObject) -> usize {
        let plain = object.to_plain();
        let bucket = self.by_market.entry(market.to_string()).or_default();

        if !object.descriptor().is_security_list() {
            bucket.push(SecurityEntry {
                market: market.to_string(),
                qualified_name: plain.meta_name,
                code: plain.code,
                fields: plain.fields,
            });
            return 1;
        }

        let rows = object
            .iter()
            .filter_map(|(_, value)| value.map(FieldValue::len))
            .max()
            .unwrap_or(0);
        for row in 0..rows {
            let fields: BTreeMap<String, Value> = plain
                .fields
                .iter()
                .map(|(name, column)| {
                    let cell = column.get(row).cloned().unwrap_or(Value::Null);
                    (name.clone(), cell)
                })
                .collect();
            let code = ["code", "codes"]
                .iter()
                .find_map(|key| fields.get(*key).and_then(Value::as_str))
                .map_or_else(|| format!("{}#{row}", plain.code), str::to_string);
            bucket.push(SecurityEntry {
                market: market.to_string(),
                qualified_name: plain.meta_name.clone(),
                code,
                fields,
            });
        }
        rows
    }

    /// Entries for one market.
    #[must_use]
    pub fn market(&self, market: &str) -> Option<&[SecurityEntry]> {
        self.by_market.get(market).map(Vec::as_slice)
    }

    /// Markets with a bucket.
    pub fn markets(&self) -> impl Iterator<Item = &str> {
        self.by_market.keys().map(String::as_str)
    }

    /// Total entries across markets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_market.values().map(Vec::len).sum()
    }

    /// Whether no entries exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read-only bootstrap state captured once and shared.
#[derive(Debug, Clone, Default)]
pub struct BootstrapSnapshot {
    /// Schema descriptors.
    pub schema: Arc<SchemaRegistry>,
    /// Market revision entries.
    pub markets: Arc<MarketMap>,
    /// Security index.
    pub securities: Arc<SecurityIndex>,
}
