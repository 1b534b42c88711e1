//! Table → query key lookup.
//!
//! Every key listed for a table must name a query whose data is read from that
//! table. Overlap between tables is expected: aggregate keys such as
//! `dashboard-stats` depend on several tables and appear under each of them.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::cache::QueryKey;

/// Tables the dashboard listens to unless configuration says otherwise.
pub const DEFAULT_WATCHED_TABLES: &[&str] = &[
    "rooms",
    "occupants",
    "occupant_room_assignments",
    "keys",
    "key_assignments",
    "lighting_fixtures",
    "supply_requests",
    "issues",
    "inventory_items",
    "inventory_item_transactions",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("watched tables without mapped query keys: {}", tables.join(", "))]
    Uncovered { tables: Vec<String> },
}

/// Static lookup from table name to the query keys that depend on it.
#[derive(Debug, Clone)]
pub struct InvalidationMap {
    entries: BTreeMap<String, Vec<QueryKey>>,
}

impl InvalidationMap {
    /// A map with no entries.
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// The courthouse facilities map.
    pub fn courthouse() -> Self {
        Self::empty()
            .with_entry("rooms", [keys(&["rooms"]), keys(&["spaces"]), stats()])
            .with_entry(
                "occupants",
                [keys(&["occupants"]), keys(&["rooms"]), stats()],
            )
            .with_entry(
                "occupant_room_assignments",
                [
                    keys(&["occupants"]),
                    keys(&["rooms"]),
                    keys(&["room-assignments"]),
                ],
            )
            .with_entry("keys", [keys(&["keys"]), keys(&["keys-stats"])])
            .with_entry(
                "key_assignments",
                [
                    keys(&["keys"]),
                    keys(&["key-assignments"]),
                    keys(&["occupants"]),
                    keys(&["keys-stats"]),
                ],
            )
            .with_entry(
                "lighting_fixtures",
                [keys(&["lighting"]), keys(&["lighting-fixtures"]), stats()],
            )
            .with_entry(
                "supply_requests",
                [
                    keys(&["supply-requests"]),
                    keys(&["supply-requests", "user"]),
                    stats(),
                ],
            )
            .with_entry("issues", [keys(&["issues"]), stats()])
            .with_entry(
                "inventory_items",
                [keys(&["inventory", "all"]), keys(&["inventory-stats"])],
            )
            // The namespace key already covers ["inventory", "transactions"];
            // both stay listed until narrower coverage is proven by tests.
            .with_entry(
                "inventory_item_transactions",
                [
                    keys(&["inventory"]),
                    keys(&["inventory", "transactions"]),
                    keys(&["inventory-stats"]),
                ],
            )
    }

    pub fn with_entry<I>(mut self, table: impl Into<String>, keys: I) -> Self
    where
        I: IntoIterator<Item = QueryKey>,
    {
        self.insert(table.into(), keys.into_iter().collect());
        self
    }

    /// Replace the keys mapped for `table`.
    pub fn insert(&mut self, table: String, keys: Vec<QueryKey>) {
        self.entries.insert(table, keys);
    }

    /// Keys to invalidate when `table` changes; empty for unknown tables.
    pub fn resolve(&self, table: &str) -> &[QueryKey] {
        self.entries.get(table).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn tables(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Watched tables whose changes would invalidate nothing.
    pub fn unmapped<'a, S>(&self, watched: &'a [S]) -> Vec<&'a str>
    where
        S: AsRef<str>,
    {
        watched
            .iter()
            .map(AsRef::as_ref)
            .filter(|table| self.resolve(table).is_empty())
            .collect()
    }

    pub fn ensure_covers<S>(&self, watched: &[S]) -> Result<(), MapError>
    where
        S: AsRef<str>,
    {
        let missing = self.unmapped(watched);
        if missing.is_empty() {
            return Ok(());
        }
        Err(MapError::Uncovered {
            tables: missing.into_iter().map(str::to_string).collect(),
        })
    }
}

impl Default for InvalidationMap {
    fn default() -> Self {
        Self::courthouse()
    }
}

fn keys(segments: &[&str]) -> QueryKey {
    QueryKey::new(segments.iter().copied())
}

fn stats() -> QueryKey {
    QueryKey::from("dashboard-stats")
}
