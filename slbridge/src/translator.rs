// translator.rs

//! The SQL dialect translator.
//!
//! [`translate`] is the one entry point: given one statement of the host's
//! SQL dialect, it returns the equivalent statement for the backend plus the
//! parameter-position mapping the statement lifecycle engine needs to bind
//! against. It is a pure function — no I/O, no shared state beyond the
//! read-only [`upsert::ConflictRegistry`] passed in by the caller — so it is
//! safe to call from any thread, and from tests, without touching a
//! database.
//!
//! Each rewrite is its own pass: a `&str -> String` function that respects
//! string-literal boundaries (tracked with [`segment`], a simple in-string
//! scanner) and never recurses. Passes compose by running one after another
//! over the whole statement; a statement that already conforms to the
//! backend's dialect survives every pass unchanged.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::upsert::{build_upsert, ConflictRegistry};

/// The result of translating one statement.
#[derive(Debug, Clone)]
pub struct Translation {
    /// The backend-dialect SQL.
    pub sql: String,
    /// Number of distinct `$N` parameters the translated SQL references.
    pub param_count: usize,
    /// `param_names[i]` is the host-dialect name bound to `$  {i+1}`: the
    /// literal name for `:name`/`@name`/`$name` placeholders, or the
    /// positional form (`"?1"`, `"?2"`, ...) for anonymous ones.
    pub param_names: Vec<String>,
    /// Always `true`: a failure to recognize a construct is not a
    /// translation error, it is a no-op on that construct (see module docs
    /// on advisory failure).
    pub success: bool,
    /// Set when a pass recognized, but could not safely rewrite, a
    /// construct. Advisory only: `sql` is still usable, and the backend's
    /// own error is what the host ultimately sees.
    pub error: Option<String>,
}

/// Translates one Engine-L statement into its Engine-R equivalent.
///
/// `registry` supplies the upsert conflict-target mapping; callers that
/// have no table-specific overrides can pass `&ConflictRegistry::default()`.
pub fn translate(sql: &str, registry: &ConflictRegistry) -> Translation {
    let mut warning = None;

    // Passes that reinterpret single-quoted text as an identifier must run
    // before the literal/code segmentation every other pass relies on.
    let sql = requote_dotted_identifiers(sql);
    let sql = requote_ddl_identifiers(&sql);

    let (sql, param_count, param_names) = rewrite_placeholders(&sql);

    let sql = map_code(&sql, |c| c.replace('`', "\""));
    let sql = map_code(&sql, rewrite_ddl_types);
    let sql = map_code(&sql, rewrite_functions);
    let sql = map_code(&sql, rewrite_operators);
    let sql = map_code(&sql, rewrite_keywords_simple);
    let sql = map_code(&sql, rewrite_create_idempotency);
    let sql = rewrite_on_conflict_quoting(&sql);
    let sql = rewrite_catalog_references(&sql);

    let sql = match rewrite_insert_or_replace(&sql, registry) {
        Ok(s) => s,
        Err(e) => {
            warning = Some(e);
            sql
        }
    };
    let sql = rewrite_insert_or_ignore(&sql);
    let sql = dedup_update_set(&sql);
    let sql = complete_group_by(&sql);

    Translation {
        sql,
        param_count,
        param_names,
        success: true,
        error: warning,
    }
}

/// Appends `RETURNING id` to a bare `INSERT` that does not already request
/// one. Used only by the no-statement `exec` shortcut (see
/// [`crate::registry::Runtime::exec`]), so a single round trip captures the
/// inserted row's id without a follow-up `lastval()` query.
pub fn ensure_insert_returning_id(sql: &str) -> String {
    static IS_INSERT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\s*INSERT\b").unwrap());
    static HAS_RETURNING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bRETURNING\b").unwrap());

    if !IS_INSERT.is_match(sql) || HAS_RETURNING.is_match(sql) {
        return sql.to_string();
    }

    let trimmed = sql.trim_end();
    match trimmed.strip_suffix(';') {
        Some(body) => format!("{} RETURNING id;", body),
        None => format!("{} RETURNING id", trimmed),
    }
}

/// Recognizes a statement that has no Engine-R equivalent and is safely
/// treated as an immediate, no-op success (see the statement lifecycle
/// engine's skip-pattern handling).
pub fn is_skip_pattern(sql: &str) -> bool {
    static SKIP_HEAD: Lazy<Regex> = Lazy::new(|| {
        Regex::new(
            r"(?is)^\s*(PRAGMA\b|VACUUM\b|ATTACH\s+DATABASE\b|DETACH\s+DATABASE\b|SAVEPOINT\b|RELEASE\s+SAVEPOINT\b|ROLLBACK\s+TO\s+SAVEPOINT\b|CREATE\s+VIRTUAL\s+TABLE\b|REINDEX\b|ANALYZE\b)",
        )
        .unwrap()
    });
    SKIP_HEAD.is_match(sql)
}

// ---------------------------------------------------------------------
// String-literal-aware segmentation
// ---------------------------------------------------------------------

enum Segment {
    Code(String),
    Literal(String),
}

/// Splits `sql` into alternating code and single-quoted string-literal
/// spans. `''` inside a literal is the escaped-quote form and does not end
/// the literal.
fn segment(sql: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut code = String::new();
    let mut rest = sql;

    loop {
        match rest.find('\'') {
            None => {
                code.push_str(rest);
                break;
            }
            Some(pos) => {
                code.push_str(&rest[..pos]);
                segments.push(Segment::Code(std::mem::take(&mut code)));

                let bytes = rest.as_bytes();
                let mut i = pos + 1;
                while i < bytes.len() {
                    if bytes[i] == b'\'' {
                        if i + 1 < bytes.len() && bytes[i + 1] == b'\'' {
                            i += 2;
                        } else {
                            i += 1;
                            break;
                        }
                    } else {
                        i += 1;
                    }
                }
                segments.push(Segment::Literal(rest[pos..i].to_string()));
                rest = &rest[i..];
            }
        }
    }

    segments.push(Segment::Code(code));
    segments
}

/// Applies `f` to every code span of `sql`, leaving string literals
/// untouched, and reassembles the result.
fn map_code(sql: &str, f: impl Fn(&str) -> String) -> String {
    segment(sql)
        .into_iter()
        .map(|seg| match seg {
            Segment::Code(c) => f(&c),
            Segment::Literal(l) => l,
        })
        .collect()
}

/// Splits `s` on commas at paren-depth zero, itself skipping single-quoted
/// spans so a literal containing a comma is never split.
fn split_top_level_commas(s: &str) -> Vec<&str> {
    let bytes = s.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_str = false;
    let mut start = 0usize;
    let mut i = 0usize;

    while i < bytes.len() {
        let c = bytes[i];
        if in_str {
            if c == b'\'' {
                if i + 1 < bytes.len() && bytes[i + 1] == b'\'' {
                    i += 1;
                } else {
                    in_str = false;
                }
            }
        } else {
            match c {
                b'\'' => in_str = true,
                b'(' => depth += 1,
                b')' => depth -= 1,
                b',' if depth == 0 => {
                    parts.push(&s[start..i]);
                    start = i + 1;
                }
                _ => {}
            }
        }
        i += 1;
    }
    parts.push(&s[start..]);
    parts
}

/// Finds every call matching `head` (a pattern ending in a literal `(`) and
/// replaces the whole call — head through matching close paren — with
/// `build(args)`, where `args` is the text between the parens. Used for
/// every rewrite that must balance parens rather than match a fixed-width
/// pattern (`typeof(...)`, `iif(...)`, `strftime(...)`, `ON CONFLICT(...)`).
fn replace_calls(input: &str, head: &Regex, build: impl Fn(&str) -> String) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last = 0usize;
    let mut search_from = 0usize;
    let bytes = input.as_bytes();

    while let Some(m) = head.find(&input[search_from..]) {
        let abs_start = search_from + m.start();
        let open_abs = search_from + m.end(); // just past the '('

        let mut depth = 1i32;
        let mut idx = open_abs;
        while idx < bytes.len() && depth > 0 {
            match bytes[idx] {
                b'(' => depth += 1,
                b')' => depth -= 1,
                _ => {}
            }
            idx += 1;
        }

        if depth != 0 {
            // Unbalanced parens: leave the remainder untouched.
            break;
        }

        out.push_str(&input[last..abs_start]);
        let args = &input[open_abs..idx - 1];
        out.push_str(&build(args));
        last = idx;
        search_from = idx;
    }

    out.push_str(&input[last..]);
    out
}

// ---------------------------------------------------------------------
// Parameter placeholders
// ---------------------------------------------------------------------

fn rewrite_placeholders(sql: &str) -> (String, usize, Vec<String>) {
    static PLACEHOLDER: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\?(\d+)?|[:@$]([A-Za-z_][A-Za-z0-9_]*)").unwrap());

    let mut next_pos = 1usize;
    let mut max_pos = 0usize;
    let mut named: HashMap<String, usize> = HashMap::new();
    let mut names: Vec<Option<String>> = Vec::new();

    let rewritten = map_code(sql, |code| {
        let mut out = String::with_capacity(code.len());
        let mut last = 0usize;
        for caps in PLACEHOLDER.captures_iter(code) {
            let m = caps.get(0).unwrap();
            out.push_str(&code[last..m.start()]);
            last = m.end();

            if let Some(explicit) = caps.get(1) {
                let n: usize = explicit.as_str().parse().unwrap_or(1).max(1);
                while names.len() < n {
                    names.push(None);
                }
                names[n - 1] = Some(format!("?{}", n));
                next_pos = next_pos.max(n + 1);
                max_pos = max_pos.max(n);
                out.push('$');
                out.push_str(&n.to_string());
            } else if m.as_str() == "?" {
                let n = next_pos;
                next_pos += 1;
                max_pos = max_pos.max(n);
                while names.len() < n {
                    names.push(None);
                }
                names[n - 1] = Some(format!("?{}", n));
                out.push('$');
                out.push_str(&n.to_string());
            } else {
                let name = caps.get(2).unwrap().as_str().to_string();
                let pos = *named.entry(name.clone()).or_insert_with(|| {
                    let n = next_pos;
                    next_pos += 1;
                    n
                });
                max_pos = max_pos.max(pos);
                while names.len() < pos {
                    names.push(None);
                }
                names[pos - 1] = Some(name);
                out.push('$');
                out.push_str(&pos.to_string());
            }
        }
        out.push_str(&code[last..]);
        out
    });

    let resolved: Vec<String> = (0..max_pos)
        .map(|i| {
            names
                .get(i)
                .cloned()
                .flatten()
                .unwrap_or_else(|| format!("?{}", i + 1))
        })
        .collect();

    (rewritten, max_pos, resolved)
}

// ---------------------------------------------------------------------
// Identifier requoting (single-quoted identifiers -> double-quoted)
// ---------------------------------------------------------------------

fn requote_dotted_identifiers(sql: &str) -> String {
    static AFTER_DOT: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\.\s*'([A-Za-z_][A-Za-z0-9_]*)'").unwrap());
    AFTER_DOT
        .replace_all(sql, ".\"$1\"")
        .into_owned()
}

fn requote_ddl_identifiers(sql: &str) -> String {
    static DDL_NAME: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?i)(CREATE\s+(?:TABLE|INDEX|UNIQUE\s+INDEX)(?:\s+IF\s+NOT\s+EXISTS)?\s+)'([^']*)'")
            .unwrap()
    });
    DDL_NAME
        .replace_all(sql, |caps: &regex::Captures| {
            format!("{}\"{}\"", &caps[1], &caps[2])
        })
        .into_owned()
}

// ---------------------------------------------------------------------
// DDL type names
// ---------------------------------------------------------------------

fn rewrite_ddl_types(code: &str) -> String {
    static PK_AUTOINCREMENT: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?i)\bINTEGER\s+PRIMARY\s+KEY\s+AUTOINCREMENT\b").unwrap()
    });
    static BARE_AUTOINCREMENT: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)\bAUTOINCREMENT\b").unwrap());
    static INTEGER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bINTEGER\b").unwrap());
    static REAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bREAL\b").unwrap());
    static BLOB: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bBLOB\b").unwrap());

    let code = PK_AUTOINCREMENT.replace_all(
        code,
        "BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY",
    );
    let code = BARE_AUTOINCREMENT.replace_all(&code, "GENERATED ALWAYS AS IDENTITY");
    let code = INTEGER.replace_all(&code, "BIGINT");
    let code = REAL.replace_all(&code, "DOUBLE PRECISION");
    let code = BLOB.replace_all(&code, "BYTEA");
    code.into_owned()
}

// ---------------------------------------------------------------------
// Functions
// ---------------------------------------------------------------------

fn rewrite_functions(code: &str) -> String {
    static IFNULL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bIFNULL\s*\(").unwrap());
    static SUBSTR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bSUBSTR\s*\(").unwrap());
    static TYPEOF_HEAD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\btypeof\s*\(").unwrap());
    static IIF_HEAD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\biif\s*\(").unwrap());
    static STRFTIME_HEAD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bstrftime\s*\(").unwrap());
    static UNIXEPOCH_HEAD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bunixepoch\s*\(").unwrap());
    static JSON_EACH_HEAD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bjson_each\s*\(").unwrap());
    static LAST_INSERT_ROWID: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)\blast_insert_rowid\s*\(\s*\)").unwrap());

    let code = IFNULL.replace_all(code, "COALESCE(");
    let code = SUBSTR.replace_all(&code, "SUBSTRING(");
    let code = LAST_INSERT_ROWID.replace_all(&code, "lastval()");

    let code = replace_calls(&code, &TYPEOF_HEAD, |args| {
        // pg_typeof(x)::text yields 'bigint'/'double precision'; the host
        // predicate vocabulary is SQLite's own 'integer'/'real', so the
        // cast result is remapped back into it.
        format!(
            "(CASE pg_typeof({0})::text \
WHEN 'bigint' THEN 'integer' WHEN 'integer' THEN 'integer' \
WHEN 'double precision' THEN 'real' WHEN 'real' THEN 'real' \
ELSE pg_typeof({0})::text END)",
            args
        )
    });
    let code = replace_calls(&code, &IIF_HEAD, |args| {
        let parts = split_top_level_commas(args);
        if parts.len() == 3 {
            format!(
                "CASE WHEN {} THEN {} ELSE {} END",
                parts[0].trim(),
                parts[1].trim(),
                parts[2].trim()
            )
        } else {
            format!("iif({})", args)
        }
    });
    let code = replace_calls(&code, &STRFTIME_HEAD, |args| {
        let parts = split_top_level_commas(args);
        if parts.is_empty() || parts[0].trim() != "'%s'" {
            return format!("strftime({})", args);
        }
        let mut rendered = if parts.len() > 1 {
            translate_time_value(parts[1])
        } else {
            "NOW()".to_string()
        };
        for modifier in parts.iter().skip(2) {
            if let Some(interval) = translate_modifier(modifier) {
                rendered.push(' ');
                rendered.push_str(&interval);
            }
        }
        format!("EXTRACT(EPOCH FROM ({}))::bigint", rendered)
    });
    let code = replace_calls(&code, &UNIXEPOCH_HEAD, |args| {
        let parts = split_top_level_commas(args);
        if parts.is_empty() || parts[0].trim().is_empty() {
            return "EXTRACT(EPOCH FROM NOW())::bigint".to_string();
        }
        let mut rendered = translate_time_value(parts[0]);
        for modifier in parts.iter().skip(1) {
            if let Some(interval) = translate_modifier(modifier) {
                rendered.push(' ');
                rendered.push_str(&interval);
            }
        }
        format!("EXTRACT(EPOCH FROM ({}))::bigint", rendered)
    });
    let code = replace_calls(&code, &JSON_EACH_HEAD, |args| {
        format!("json_array_elements({}::json)", args.trim())
    });

    code
}

fn translate_time_value(expr: &str) -> String {
    let trimmed = expr.trim();
    if trimmed.trim_matches('\'').eq_ignore_ascii_case("now") {
        "NOW()".to_string()
    } else {
        trimmed.to_string()
    }
}

fn translate_modifier(expr: &str) -> Option<String> {
    static MODIFIER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([+-]?\d+)\s+(\w+)$").unwrap());
    let trimmed = expr.trim().trim_matches('\'');
    let caps = MODIFIER.captures(trimmed)?;
    let amount: i64 = caps[1].parse().ok()?;
    let unit = &caps[2];
    if amount < 0 {
        Some(format!("- INTERVAL '{} {}'", -amount, unit))
    } else {
        Some(format!("+ INTERVAL '{} {}'", amount, unit))
    }
}

// ---------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------

fn rewrite_operators(code: &str) -> String {
    static GLOB: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bGLOB\b").unwrap());
    static OP_MINUS: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(!=|<>|>=|<=|=|>|<)(-\d)").unwrap());

    let code = GLOB.replace_all(code, "LIKE");
    let code = OP_MINUS.replace_all(&code, "$1 $2");
    code.into_owned()
}

// ---------------------------------------------------------------------
// Keywords (simple, position-independent substitutions)
// ---------------------------------------------------------------------

fn rewrite_keywords_simple(code: &str) -> String {
    static BEGIN_MODE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)\bBEGIN\s+(IMMEDIATE|DEFERRED|EXCLUSIVE)\b").unwrap());
    static EMPTY_IN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bIN\s*\(\s*\)").unwrap());
    static GROUP_BY_NULL: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)\bGROUP\s+BY\s+NULL\b").unwrap());
    static COLLATE_ICU: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)\bCOLLATE\s+icu_root\b").unwrap());
    static INDEXED_BY: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)\bINDEXED\s+BY\s+[A-Za-z_][A-Za-z0-9_]*\b").unwrap());
    static NOT_INDEXED: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bNOT\s+INDEXED\b").unwrap());

    let code = BEGIN_MODE.replace_all(code, "BEGIN");
    let code = EMPTY_IN.replace_all(&code, "IN (SELECT -1 WHERE FALSE)");
    let code = GROUP_BY_NULL.replace_all(&code, "");
    let code = COLLATE_ICU.replace_all(&code, "");
    let code = INDEXED_BY.replace_all(&code, "");
    let code = NOT_INDEXED.replace_all(&code, "");
    code.into_owned()
}

// ---------------------------------------------------------------------
// CREATE idempotency
// ---------------------------------------------------------------------

fn rewrite_create_idempotency(code: &str) -> String {
    static CREATE_TABLE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)\bCREATE\s+TABLE\s+(?!IF\s+NOT\s+EXISTS\b)").unwrap());
    static CREATE_INDEX: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?i)\bCREATE\s+(UNIQUE\s+)?INDEX\s+(?!IF\s+NOT\s+EXISTS\b)").unwrap()
    });
    // The lookahead folds the optional `COLUMN` into the rejected
    // alternative so it applies at a single position right after `ADD `,
    // regardless of whether the consuming `(?:COLUMN\s+)?` below would
    // match it: without this, the engine can backtrack the consuming group
    // to skip `COLUMN `, find that "IF NOT EXISTS" isn't literally next
    // (because "COLUMN IF NOT EXISTS" is), and re-insert a second
    // `COLUMN IF NOT EXISTS` on already-idempotent input.
    static ALTER_ADD: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?i)\bADD\s+(?!(?:COLUMN\s+)?IF\s+NOT\s+EXISTS\b)(?:COLUMN\s+)?").unwrap()
    });
    static ALTER_TABLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bALTER\s+TABLE\b").unwrap());

    let code = CREATE_TABLE.replace_all(code, "CREATE TABLE IF NOT EXISTS ");
    let code = CREATE_INDEX.replace_all(&code, |caps: &regex::Captures| {
        format!(
            "CREATE {}INDEX IF NOT EXISTS ",
            caps.get(1).map(|m| m.as_str()).unwrap_or("")
        )
    });
    // Only meaningful on ALTER TABLE statements; cheap enough to scan for
    // that context rather than risk rewriting an unrelated "ADD" elsewhere.
    if ALTER_TABLE.is_match(&code) {
        ALTER_ADD.replace_all(&code, "ADD COLUMN IF NOT EXISTS ").into_owned()
    } else {
        code.into_owned()
    }
}

// ---------------------------------------------------------------------
// ON CONFLICT column-name unquoting
// ---------------------------------------------------------------------

fn rewrite_on_conflict_quoting(sql: &str) -> String {
    static ON_CONFLICT_HEAD: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)\bON\s+CONFLICT\s*\(").unwrap());

    map_code(sql, |code| {
        replace_calls(code, &ON_CONFLICT_HEAD, |args| {
            let unquoted: Vec<String> = split_top_level_commas(args)
                .iter()
                .map(|c| c.trim().trim_matches('"').to_string())
                .collect();
            format!("ON CONFLICT ({})", unquoted.join(", "))
        })
    })
}

// ---------------------------------------------------------------------
// Engine-L catalog references
// ---------------------------------------------------------------------

fn rewrite_catalog_references(sql: &str) -> String {
    static CATALOG_NAME: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)\bsqlite_(?:master|schema)\b").unwrap());

    const CATALOG_QUERY: &str = "(\
SELECT 'table' AS type, table_name AS name, table_name AS tbl_name, 0 AS rootpage, '' AS sql \
FROM information_schema.tables WHERE table_schema = current_schema() \
UNION ALL \
SELECT 'index' AS type, indexname AS name, tablename AS tbl_name, 0 AS rootpage, indexdef AS sql \
FROM pg_indexes WHERE schemaname = current_schema()\
) AS sqlite_master";

    map_code(sql, |code| {
        CATALOG_NAME
            .replace_all(code, CATALOG_QUERY)
            .into_owned()
    })
}

// ---------------------------------------------------------------------
// REPLACE INTO / INSERT OR REPLACE -> upsert
// ---------------------------------------------------------------------

fn rewrite_insert_or_replace(sql: &str, registry: &ConflictRegistry) -> Result<String, String> {
    static REPLACE_INSERT: Lazy<Regex> = Lazy::new(|| {
        Regex::new(
            r"(?is)^(\s*)(?:REPLACE\s+INTO|INSERT\s+OR\s+REPLACE\s+INTO)\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(([^)]*)\)\s*(VALUES\s*\(.*\))\s*;?\s*$",
        )
        .unwrap()
    });

    let caps = match REPLACE_INSERT.captures(sql) {
        Some(c) => c,
        None => return Ok(sql.to_string()),
    };

    let table = &caps[2];
    let columns: Vec<&str> = split_top_level_commas(&caps[3])
        .iter()
        .map(|c| c.trim())
        .collect();
    let values = caps[4].trim();

    let upsert_clause = build_upsert(registry, table, &columns);

    Ok(format!(
        "{}INSERT INTO {}({}) {} {}",
        &caps[1],
        table,
        columns.join(", "),
        values,
        upsert_clause
    ))
}

fn rewrite_insert_or_ignore(sql: &str) -> String {
    static IGNORE_INSERT: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?is)^(\s*)INSERT\s+OR\s+IGNORE\s+INTO\s+(.*?)\s*;?\s*$").unwrap());

    match IGNORE_INSERT.captures(sql) {
        Some(caps) => format!(
            "{}INSERT INTO {} ON CONFLICT DO NOTHING",
            &caps[1], &caps[2]
        ),
        None => sql.to_string(),
    }
}

// ---------------------------------------------------------------------
// Duplicate SET assignments
// ---------------------------------------------------------------------

fn dedup_update_set(sql: &str) -> String {
    static UPDATE_SET_HEAD: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?is)\bUPDATE\s+[A-Za-z_][A-Za-z0-9_.\"]*\s+SET\s+").unwrap());
    static CLAUSE_END: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)\b(WHERE|RETURNING|ORDER\s+BY|LIMIT)\b").unwrap());

    let head_match = match UPDATE_SET_HEAD.find(sql) {
        Some(m) => m,
        None => return sql.to_string(),
    };

    let tail = &sql[head_match.end()..];
    let (set_clause, rest) = match CLAUSE_END.find(tail) {
        Some(end) => (&tail[..end.start()], &tail[end.start()..]),
        None => {
            // Strip a trailing semicolon, if present, from the SET clause.
            let trimmed = tail.trim_end();
            let semi = trimmed.ends_with(';');
            let body = if semi {
                &trimmed[..trimmed.len() - 1]
            } else {
                trimmed
            };
            (body, if semi { ";" } else { "" })
        }
    };

    let assignments = split_top_level_commas(set_clause);
    let mut order: Vec<String> = Vec::new();
    let mut values: HashMap<String, String> = HashMap::new();

    for assignment in assignments {
        let trimmed = assignment.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(eq) = find_assignment_eq(trimmed) {
            let col = trimmed[..eq].trim().to_string();
            if !values.contains_key(&col) {
                order.push(col.clone());
            } else {
                order.retain(|c| c != &col);
                order.push(col.clone());
            }
            values.insert(col, trimmed.to_string());
        }
    }

    let rebuilt: Vec<String> = order.into_iter().map(|c| values.remove(&c).unwrap()).collect();

    format!(
        "{}{}{}",
        &sql[..head_match.end()],
        rebuilt.join(", "),
        rest
    )
}

/// Finds the `=` that separates an assignment's column from its value,
/// skipping the two-character comparison operators that contain `=`.
fn find_assignment_eq(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b == b'=' {
            let prev = if i > 0 { bytes[i - 1] } else { 0 };
            let next = if i + 1 < bytes.len() { bytes[i + 1] } else { 0 };
            if prev == b'!' || prev == b'<' || prev == b'>' || next == b'=' {
                continue;
            }
            return Some(i);
        }
    }
    None
}

// ---------------------------------------------------------------------
// GROUP BY completion
// ---------------------------------------------------------------------

fn complete_group_by(sql: &str) -> String {
    static SELECT_FROM: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bSELECT\b").unwrap());
    static FROM_KW: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bFROM\b").unwrap());
    static GROUP_BY_KW: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bGROUP\s+BY\b").unwrap());
    static CLAUSE_END: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)\b(HAVING|ORDER\s+BY|LIMIT)\b").unwrap());
    static AGGREGATE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?i)^(COUNT|SUM|AVG|MIN|MAX|GROUP_CONCAT|STRING_AGG)\s*\(").unwrap()
    });
    static DOTTED: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*\.[A-Za-z_][A-Za-z0-9_]*$").unwrap());
    static ALIASED: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)^(.*)\s+AS\s+([A-Za-z_][A-Za-z0-9_]*)$").unwrap());

    let select_start = match SELECT_FROM.find(sql) {
        Some(m) => m.end(),
        None => return sql.to_string(),
    };
    let from_match = match FROM_KW.find(&sql[select_start..]) {
        Some(m) => m,
        None => return sql.to_string(),
    };
    let select_list = &sql[select_start..select_start + from_match.start()];

    let group_by_match = match GROUP_BY_KW.find(&sql[select_start + from_match.end()..]) {
        Some(m) => m,
        None => return sql.to_string(),
    };
    let group_by_abs_start = select_start + from_match.end() + group_by_match.end();
    let after_group_by = &sql[group_by_abs_start..];

    let (group_by_clause, tail) = match CLAUSE_END.find(after_group_by) {
        Some(end) => (&after_group_by[..end.start()], &after_group_by[end.start()..]),
        None => {
            let trimmed = after_group_by.trim_end();
            let semi = trimmed.ends_with(';');
            if semi {
                (&trimmed[..trimmed.len() - 1], ";")
            } else {
                (trimmed, "")
            }
        }
    };

    let existing: Vec<String> = split_top_level_commas(group_by_clause)
        .iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    if existing.is_empty() {
        return sql.to_string();
    }

    let mut additions = Vec::new();
    for item in split_top_level_commas(select_list) {
        let item = item.trim();
        if item.is_empty() || item == "*" {
            continue;
        }
        if AGGREGATE.is_match(item) {
            continue;
        }
        if item.to_ascii_uppercase().contains("CASE") {
            continue;
        }
        if item.starts_with('(') {
            continue;
        }

        let candidate = if let Some(caps) = ALIASED.captures(item) {
            if DOTTED.is_match(caps[1].trim()) {
                Some(caps[2].to_string())
            } else {
                None
            }
        } else if DOTTED.is_match(item) {
            Some(item.to_string())
        } else {
            None
        };

        if let Some(candidate) = candidate {
            let already_present = existing
                .iter()
                .chain(additions.iter())
                .any(|e| e.eq_ignore_ascii_case(&candidate));
            if !already_present {
                additions.push(candidate);
            }
        }
    }

    if additions.is_empty() {
        return sql.to_string();
    }

    let mut all = existing;
    all.extend(additions);

    format!(
        "{}{}{}",
        &sql[..group_by_abs_start],
        all.join(", "),
        tail
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(sql: &str) -> Translation {
        translate(sql, &ConflictRegistry::with_defaults())
    }

    #[test]
    fn s1_style_create_table_translates_types_and_becomes_idempotent() {
        let r = t("CREATE TABLE t(id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT);");
        assert_eq!(
            r.sql,
            "CREATE TABLE IF NOT EXISTS t(id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY, name TEXT);"
        );
    }

    #[test]
    fn s3_insert_or_replace_becomes_upsert_with_returning_id() {
        let r = t("INSERT OR REPLACE INTO tags(id, tag, tag_type) VALUES(1,'Action',0);");
        assert_eq!(
            r.sql,
            "INSERT INTO tags(id, tag, tag_type) VALUES(1,'Action',0) ON CONFLICT (id) DO UPDATE SET tag = EXCLUDED.tag, tag_type = EXCLUDED.tag_type RETURNING id"
        );
    }

    #[test]
    fn s4_named_placeholder_maps_to_positional_and_ifnull_to_coalesce() {
        let r = t("SELECT IFNULL(rating, 0) FROM items WHERE id = :id;");
        assert_eq!(r.sql, "SELECT COALESCE(rating, 0) FROM items WHERE id = $1;");
        assert_eq!(r.param_count, 1);
        assert_eq!(r.param_names, vec!["id".to_string()]);
    }

    #[test]
    fn s5_pragma_is_a_skip_pattern() {
        assert!(is_skip_pattern("PRAGMA journal_mode = WAL;"));
        assert!(!is_skip_pattern("SELECT 1;"));
    }

    #[test]
    fn s7_group_by_completion_adds_missing_select_columns() {
        let r = t("SELECT metadata_items.id, metadata_items.title FROM metadata_items GROUP BY metadata_items.id");
        assert_eq!(
            r.sql,
            "SELECT metadata_items.id, metadata_items.title FROM metadata_items GROUP BY metadata_items.id, metadata_items.title"
        );
    }

    #[test]
    fn repeated_named_param_reuses_position() {
        let r = t("SELECT * FROM t WHERE a = :x OR b = :x");
        assert_eq!(r.sql, "SELECT * FROM t WHERE a = $1 OR b = $1");
        assert_eq!(r.param_count, 1);
    }

    #[test]
    fn anonymous_placeholders_increment() {
        let r = t("INSERT INTO t(a, b) VALUES(?, ?)");
        assert_eq!(r.sql, "INSERT INTO t(a, b) VALUES($1, $2)");
        assert_eq!(r.param_count, 2);
    }

    #[test]
    fn string_literals_are_never_rewritten() {
        let r = t("SELECT 'INTEGER AUTOINCREMENT REAL BLOB' FROM t");
        assert_eq!(r.sql, "SELECT 'INTEGER AUTOINCREMENT REAL BLOB' FROM t");
    }

    #[test]
    fn backticks_become_double_quotes() {
        let r = t("SELECT `name` FROM `items`");
        assert_eq!(r.sql, "SELECT \"name\" FROM \"items\"");
    }

    #[test]
    fn glob_becomes_like() {
        let r = t("SELECT * FROM t WHERE name GLOB 'a*'");
        assert_eq!(r.sql, "SELECT * FROM t WHERE name LIKE 'a*'");
    }

    #[test]
    fn operator_minus_spacing_is_restored() {
        let r = t("SELECT * FROM t WHERE a !=-1 AND b<=-5");
        assert_eq!(r.sql, "SELECT * FROM t WHERE a != -1 AND b<= -5");
    }

    #[test]
    fn empty_in_list_becomes_always_false() {
        let r = t("SELECT * FROM t WHERE id IN ()");
        assert_eq!(r.sql, "SELECT * FROM t WHERE id IN (SELECT -1 WHERE FALSE)");
    }

    #[test]
    fn begin_immediate_becomes_plain_begin() {
        let r = t("BEGIN IMMEDIATE;");
        assert_eq!(r.sql, "BEGIN;");
    }

    #[test]
    fn typeof_gets_text_cast_and_nested_parens_balance() {
        let r = t("SELECT typeof(COALESCE(a, b)) FROM t");
        assert_eq!(
            r.sql,
            "SELECT (CASE pg_typeof(COALESCE(a, b))::text \
WHEN 'bigint' THEN 'integer' WHEN 'integer' THEN 'integer' \
WHEN 'double precision' THEN 'real' WHEN 'real' THEN 'real' \
ELSE pg_typeof(COALESCE(a, b))::text END) FROM t"
        );
    }

    #[test]
    fn typeof_result_vocabulary_matches_the_host_engine() {
        let r = t("SELECT typeof(x) FROM t WHERE typeof(x) = 'integer'");
        assert!(r.sql.contains("WHEN 'bigint' THEN 'integer'"));
        assert!(r.sql.contains("WHEN 'double precision' THEN 'real'"));
        // Both occurrences (the selected column and the predicate) get the
        // same remapping, so a host query comparing against 'integer'/'real'
        // still matches rows it matched against Engine-L.
        assert_eq!(r.sql.matches("CASE pg_typeof(x)::text").count(), 2);
        assert!(r.sql.ends_with("= 'integer'"));
    }

    #[test]
    fn iif_becomes_case_when() {
        let r = t("SELECT iif(a > 0, 'pos', 'neg') FROM t");
        assert_eq!(r.sql, "SELECT CASE WHEN a > 0 THEN 'pos' ELSE 'neg' END FROM t");
    }

    #[test]
    fn strftime_seconds_becomes_epoch_extract() {
        let r = t("SELECT strftime('%s', 'now') FROM t");
        assert_eq!(r.sql, "SELECT EXTRACT(EPOCH FROM (NOW()))::bigint FROM t");
    }

    #[test]
    fn last_insert_rowid_becomes_lastval() {
        let r = t("SELECT last_insert_rowid();");
        assert_eq!(r.sql, "SELECT lastval();");
    }

    #[test]
    fn r4_json_each_becomes_json_array_elements() {
        let r = t("SELECT value FROM json_each(?)");
        assert_eq!(r.sql, "SELECT value FROM json_array_elements($1::json)");
    }

    #[test]
    fn duplicate_set_assignment_keeps_rightmost() {
        let r = t("UPDATE t SET a = 1, b = 2, a = 3 WHERE id = 1");
        assert_eq!(r.sql, "UPDATE t SET b = 2, a = 3 WHERE id = 1");
    }

    #[test]
    fn on_conflict_columns_are_unquoted() {
        let r = t("INSERT INTO t(id) VALUES(1) ON CONFLICT(\"id\") DO NOTHING");
        assert_eq!(r.sql, "INSERT INTO t(id) VALUES(1) ON CONFLICT (id) DO NOTHING");
    }

    #[test]
    fn translation_is_idempotent_on_simple_statements() {
        let first = t("CREATE TABLE t(id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT);");
        let second = translate(&first.sql, &ConflictRegistry::with_defaults());
        assert_eq!(first.sql, second.sql);
    }

    #[test]
    fn alter_table_add_column_gets_if_not_exists() {
        let r = t("ALTER TABLE t ADD COLUMN name TEXT");
        assert_eq!(r.sql, "ALTER TABLE t ADD COLUMN IF NOT EXISTS name TEXT");

        let r = t("ALTER TABLE t ADD age INTEGER");
        assert_eq!(r.sql, "ALTER TABLE t ADD COLUMN IF NOT EXISTS age INTEGER");
    }

    #[test]
    fn alter_table_add_column_is_idempotent() {
        let first = t("ALTER TABLE t ADD COLUMN name TEXT");
        let second = translate(&first.sql, &ConflictRegistry::with_defaults());
        assert_eq!(first.sql, second.sql);

        let already_guarded = "ALTER TABLE t ADD COLUMN IF NOT EXISTS name TEXT";
        let rewritten = translate(already_guarded, &ConflictRegistry::with_defaults());
        assert_eq!(rewritten.sql, already_guarded);
    }

    #[test]
    fn sqlite_master_becomes_catalog_union() {
        let r = t("SELECT name FROM sqlite_master WHERE type = 'table'");
        assert!(r.sql.contains("information_schema.tables"));
        assert!(r.sql.contains("pg_indexes"));
    }

    #[test]
    fn exec_returning_id_is_added_once_to_a_bare_insert() {
        let once = ensure_insert_returning_id("INSERT INTO t(a) VALUES(1)");
        assert_eq!(once, "INSERT INTO t(a) VALUES(1) RETURNING id");
        let twice = ensure_insert_returning_id(&once);
        assert_eq!(twice, once);
    }

    #[test]
    fn exec_returning_id_leaves_non_inserts_alone() {
        let r = ensure_insert_returning_id("UPDATE t SET a = 1");
        assert_eq!(r, "UPDATE t SET a = 1");
    }
}
