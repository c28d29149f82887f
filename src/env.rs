//! Environment map
//!
//! An insertion-ordered name → value map. The root map is seeded from the
//! process environment plus `BUGGER_FILE`/`BUGGER_DIR`; group and test
//! scopes layer overrides on a clone, never mutating the parent. The single
//! mutable copy owned by the run driver is the only place `stdout-to-env`
//! results land.

use std::collections::HashMap;
use std::path::Path;

/// Ordered environment variables — order is preserved so subprocesses see
/// a deterministic environment.
#[derive(Debug, Clone, Default)]
pub struct EnvMap {
    vars: Vec<(String, String)>,
    /// Index for O(1) lookup by key → position in `vars`
    index: HashMap<String, usize>,
}

impl EnvMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Root map for a run: the OS process environment overlaid with
    /// `BUGGER_FILE` (absolute config path) and `BUGGER_DIR` (its directory).
    pub fn root(config_path: &Path) -> Self {
        let mut env = Self::new();
        for (key, value) in std::env::vars() {
            env.set(key, value);
        }
        let file = config_path
            .canonicalize()
            .unwrap_or_else(|_| config_path.to_path_buf());
        let dir = file
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_default();
        env.set("BUGGER_FILE", file.to_string_lossy());
        env.set("BUGGER_DIR", dir.to_string_lossy());
        env
    }

    /// Set a variable, overriding any existing entry in place.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(&idx) = self.index.get(&key) {
            self.vars[idx].1 = value;
        } else {
            let idx = self.vars.len();
            self.vars.push((key.clone(), value));
            self.index.insert(key, idx);
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.index.get(key).map(|&idx| self.vars[idx].1.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// All variables as key/value pairs for a subprocess.
    pub fn environ(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}
