// config.rs

//! Configuration consumed once when the core starts.
//!
//! The core never reads this from a file or environment variable itself —
//! loading and parsing configuration is the host's responsibility. This
//! module only owns the typed shape, deserializable with `serde` from
//! whatever format the host's loader chooses, and the pure function that
//! decides whether a given database path should be redirected.

use serde::Deserialize;

/// Backend connection and redirect-policy configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    host: String,
    port: u16,
    database: String,
    user: String,
    #[serde(default)]
    password: Option<String>,
    #[serde(default = "default_schema")]
    schema: String,

    #[serde(default)]
    redirect_patterns: Vec<String>,

    #[serde(default = "default_pool_size")]
    pool_size: usize,

    #[serde(default)]
    fail_fast: bool,

    #[serde(default)]
    query_cache_ttl_secs: u64,

    #[serde(default)]
    redirected_collations: Vec<String>,
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_pool_size() -> usize {
    16
}

impl Config {
    /// Creates a configuration with the given connection parameters and
    /// otherwise-default policy (no redirect patterns, pool size 16,
    /// fail-fast acquisition, caching disabled).
    pub fn new(host: &str, port: u16, database: &str, user: &str) -> Self {
        Config {
            host: host.to_string(),
            port,
            database: database.to_string(),
            user: user.to_string(),
            password: None,
            schema: default_schema(),
            redirect_patterns: Vec::new(),
            pool_size: default_pool_size(),
            fail_fast: true,
            query_cache_ttl_secs: 0,
            redirected_collations: Vec::new(),
        }
    }

    pub fn password(&mut self, password: &str) -> &mut Self {
        self.password = Some(password.to_string());
        self
    }

    pub fn schema(&mut self, schema: &str) -> &mut Self {
        self.schema = schema.to_string();
        self
    }

    /// Adds a path substring; any database path containing it is redirected.
    pub fn redirect_pattern(&mut self, pattern: &str) -> &mut Self {
        self.redirect_patterns.push(pattern.to_string());
        self
    }

    pub fn pool_size(&mut self, pool_size: usize) -> &mut Self {
        self.pool_size = pool_size;
        self
    }

    pub fn fail_fast(&mut self, fail_fast: bool) -> &mut Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Sets the query-cache TTL, in seconds. `0` disables the cache.
    pub fn query_cache_ttl_secs(&mut self, secs: u64) -> &mut Self {
        self.query_cache_ttl_secs = secs;
        self
    }

    pub fn redirected_collation(&mut self, name: &str) -> &mut Self {
        self.redirected_collations.push(name.to_string());
        self
    }

    pub fn get_host(&self) -> &str {
        &self.host
    }

    pub fn get_port(&self) -> u16 {
        self.port
    }

    pub fn get_database(&self) -> &str {
        &self.database
    }

    pub fn get_user(&self) -> &str {
        &self.user
    }

    pub fn get_password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn get_schema(&self) -> &str {
        &self.schema
    }

    pub fn get_pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn get_fail_fast(&self) -> bool {
        self.fail_fast
    }

    pub fn get_query_cache_ttl_secs(&self) -> u64 {
        self.query_cache_ttl_secs
    }

    pub fn redirected_collations(&self) -> &[String] {
        &self.redirected_collations
    }

    /// Decides whether `db_path` should be redirected to the backend.
    ///
    /// A database with no configured patterns is never redirected: the
    /// default is to leave every database alone, requiring the host to opt
    /// individual databases in.
    pub fn should_redirect(&self, db_path: &str) -> bool {
        self.redirect_patterns
            .iter()
            .any(|pat| db_path.contains(pat.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_decision_is_pattern_based() {
        let mut cfg = Config::new("localhost", 5432, "app", "app");
        cfg.redirect_pattern("/library/");

        assert!(cfg.should_redirect("/var/lib/app/library/main.db"));
        assert!(!cfg.should_redirect("/var/lib/app/cache/thumbs.db"));
    }

    #[test]
    fn no_patterns_means_no_redirect() {
        let cfg = Config::new("localhost", 5432, "app", "app");
        assert!(!cfg.should_redirect("/anything/at/all.db"));
    }
}
