use serde::Deserialize;

/// Process-level settings, read once at startup from `MAILGATE_`-prefixed
/// environment variables. Runtime-mutable settings live in the `config` table
/// (see [`crate::db::config`]).
#[derive(Clone, Deserialize)]
pub struct Config {
    pub db_path: Option<String>,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("MAILGATE_").from_env::<Self>()?)
    }

    pub fn db_path(&self) -> &str {
        self.db_path
            .as_ref()
            .map(|s| s.as_str())
            .unwrap_or("mailgate.db")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self { db_path: None }
    }
}
