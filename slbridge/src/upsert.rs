// upsert.rs

//! The `INSERT OR REPLACE` → `INSERT ... ON CONFLICT ... DO UPDATE` rewrite.
//!
//! Postgres has no direct equivalent of SQLite's `OR REPLACE` conflict
//! resolution: it needs the conflict target spelled out, and the columns to
//! update on a hit. [`ConflictRegistry`] is the static table-to-conflict-key
//! mapping the translator consults to do that; [`build_upsert`] renders the
//! actual clause once a table's key columns are known.
//!
//! The registry is seeded with the host tables whose upsert shape is known
//! in advance. A table the registry has never seen falls back to treating
//! its first column as the key, which is correct for every `id`-keyed table
//! the host's schema actually uses and conservative (translation failure,
//! not miscompilation) for anything stranger.

use std::collections::HashMap;

/// Special-cased `SET` clause behavior for specific column names, applied
/// regardless of which table they appear on.
///
/// These mirror columns the host's schema uses across many tables with the
/// same "last write wins, but don't go backwards" intent.
fn special_set_clause(table: &str, column: &str) -> Option<String> {
    match column {
        "updated_at" | "changed_at" => Some(format!(
            "{col} = COALESCE(EXCLUDED.{col}, EXTRACT(EPOCH FROM NOW())::bigint)",
            col = column
        )),
        "view_count" | "play_count" | "skip_count" => Some(format!(
            "{col} = GREATEST(EXCLUDED.{col}, {table}.{col}, 0)",
            col = column,
            table = table
        )),
        _ => None,
    }
}

/// Maps a table name to the column(s) that identify a conflicting row.
pub struct ConflictRegistry {
    keys: HashMap<&'static str, &'static [&'static str]>,
}

impl ConflictRegistry {
    /// The registry seeded with the host schema's known upsert targets.
    ///
    /// `metadata_item_settings` is listed explicitly rather than falling
    /// through to the default: its natural key is the `(guid, account_id)`
    /// pair, not a leading `id` column, and earlier source generations
    /// disagreed about whether to special-case it. This implementation
    /// always does.
    pub fn with_defaults() -> Self {
        let mut keys: HashMap<&'static str, &'static [&'static str]> = HashMap::new();
        keys.insert("metadata_item_settings", &["guid", "account_id"]);
        keys.insert("tags", &["id"]);
        keys.insert("taggings", &["id"]);
        keys.insert("metadata_items", &["id"]);
        keys.insert("media_parts", &["id"]);
        keys.insert("media_streams", &["id"]);
        keys.insert("metadata_item_views", &["id"]);
        keys.insert("accounts", &["id"]);
        ConflictRegistry { keys }
    }

    /// Returns the conflict-target columns for `table`, falling back to a
    /// single `id` column when the table is not explicitly registered.
    pub fn conflict_columns(&self, table: &str) -> &[&'static str] {
        self.keys.get(table).copied().unwrap_or(&["id"])
    }

    /// Registers (or overrides) the conflict columns for `table`.
    pub fn register(&mut self, table: &'static str, columns: &'static [&'static str]) {
        self.keys.insert(table, columns);
    }
}

impl Default for ConflictRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Renders the `ON CONFLICT (...) DO UPDATE SET ...` tail for an
/// `INSERT INTO table(cols...) VALUES(...)` whose `OR REPLACE` the
/// translator is rewriting.
///
/// `columns` is the insert's column list, in order, exactly as written by
/// the caller. Conflict-target columns are excluded from the `SET` list
/// (updating the key column against itself is meaningless). If every
/// inserted column is part of the conflict target, `DO NOTHING` is used
/// instead of an empty `DO UPDATE SET`. `RETURNING id` is appended when
/// `id` is one of the inserted columns and is not itself a conflict key.
pub fn build_upsert(registry: &ConflictRegistry, table: &str, columns: &[&str]) -> String {
    let keys = registry.conflict_columns(table);
    let set_list: Vec<String> = columns
        .iter()
        .filter(|c| !keys.contains(c))
        .map(|c| {
            special_set_clause(table, c)
                .unwrap_or_else(|| format!("{col} = EXCLUDED.{col}", col = c))
        })
        .collect();

    let conflict_target = keys.join(", ");
    let mut clause = if set_list.is_empty() {
        format!("ON CONFLICT ({}) DO NOTHING", conflict_target)
    } else {
        format!(
            "ON CONFLICT ({}) DO UPDATE SET {}",
            conflict_target,
            set_list.join(", ")
        )
    };

    if columns.contains(&"id") && !keys.contains(&"id") {
        clause.push_str(" RETURNING id");
    } else if keys.contains(&"id") {
        clause.push_str(" RETURNING id");
    }

    clause
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_keys_on_id_and_returns_it() {
        let reg = ConflictRegistry::with_defaults();
        let clause = build_upsert(&reg, "tags", &["id", "tag", "tag_type"]);
        assert_eq!(
            clause,
            "ON CONFLICT (id) DO UPDATE SET tag = EXCLUDED.tag, tag_type = EXCLUDED.tag_type RETURNING id"
        );
    }

    #[test]
    fn unregistered_table_falls_back_to_id_key() {
        let reg = ConflictRegistry::with_defaults();
        let clause = build_upsert(&reg, "some_unseen_table", &["id", "name"]);
        assert_eq!(
            clause,
            "ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name RETURNING id"
        );
    }

    #[test]
    fn composite_key_table_uses_registered_columns() {
        let reg = ConflictRegistry::with_defaults();
        let clause = build_upsert(
            &reg,
            "metadata_item_settings",
            &["guid", "account_id", "rating"],
        );
        assert_eq!(
            clause,
            "ON CONFLICT (guid, account_id) DO UPDATE SET rating = EXCLUDED.rating"
        );
    }

    #[test]
    fn updated_at_coalesces_instead_of_overwriting_with_null() {
        let reg = ConflictRegistry::with_defaults();
        let clause = build_upsert(&reg, "tags", &["id", "updated_at"]);
        assert!(clause.contains("updated_at = COALESCE(EXCLUDED.updated_at, EXTRACT(EPOCH FROM NOW())::bigint)"));
    }

    #[test]
    fn view_count_never_goes_backwards() {
        let reg = ConflictRegistry::with_defaults();
        let clause = build_upsert(&reg, "metadata_item_views", &["id", "view_count"]);
        assert!(clause.contains("view_count = GREATEST(EXCLUDED.view_count, metadata_item_views.view_count, 0)"));
    }

    #[test]
    fn all_columns_in_conflict_target_does_nothing() {
        let mut reg = ConflictRegistry::with_defaults();
        reg.register("solo", &["id"]);
        let clause = build_upsert(&reg, "solo", &["id"]);
        assert_eq!(clause, "ON CONFLICT (id) DO NOTHING RETURNING id");
    }
}
