use crate::aggregate::SummaryStrategy;
use crate::error::ConfigError;
use crate::retry::RetryConfig;
use crate::view::{ListOptions, ListRefresh};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Where messages live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    /// Hosted PostgREST + Realtime project.
    Supabase { url: String, anon_key: String },
    /// Local SQLite file with an in-process change feed.
    Sqlite { path: PathBuf },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub backend: Backend,
    pub table: String,
    pub summary_strategy: SummaryStrategy,
    pub list_refresh: ListRefresh,
    pub http_addr: SocketAddr,
    pub reconnect: RetryConfig,
}

impl Config {
    /// Reads the process environment. `.env` is loaded once, at startup.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let url = get("SUPABASE_URL").or_else(|| get("NEXT_PUBLIC_SUPABASE_URL"));
        let anon_key = get("SUPABASE_ANON_KEY").or_else(|| get("NEXT_PUBLIC_SUPABASE_ANON_KEY"));

        let backend_kind = match get("WHATSVIEW_BACKEND") {
            Some(kind) => kind,
            None if url.is_some() => "supabase".to_string(),
            None => "sqlite".to_string(),
        };

        let backend = match backend_kind.as_str() {
            "supabase" => Backend::Supabase {
                url: url.ok_or(ConfigError::Missing("SUPABASE_URL"))?,
                anon_key: anon_key.ok_or(ConfigError::Missing("SUPABASE_ANON_KEY"))?,
            },
            "sqlite" => {
                let path = match get("WHATSVIEW_DB_PATH") {
                    Some(path) => PathBuf::from(path),
                    None => {
                        let home = get("HOME").unwrap_or_else(|| ".".into());
                        PathBuf::from(home).join(".whatsview").join("messages.db")
                    }
                };
                Backend::Sqlite { path }
            }
            other => return Err(invalid("WHATSVIEW_BACKEND", other, "expected 'supabase' or 'sqlite'")),
        };

        let table = get("WHATSVIEW_TABLE").unwrap_or_else(|| "messages".into());
        if !is_identifier(&table) {
            return Err(invalid("WHATSVIEW_TABLE", &table, "not a plain table name"));
        }

        let summary_strategy = parse_or("WHATSVIEW_SUMMARY_STRATEGY", get("WHATSVIEW_SUMMARY_STRATEGY"))?;
        let list_refresh = parse_or("WHATSVIEW_LIST_REFRESH", get("WHATSVIEW_LIST_REFRESH"))?;

        let http_addr = match get("WHATSVIEW_HTTP_ADDR") {
            Some(addr) => addr
                .parse()
                .map_err(|e: std::net::AddrParseError| invalid("WHATSVIEW_HTTP_ADDR", &addr, &e.to_string()))?,
            None => SocketAddr::from(([0, 0, 0, 0], 3000)),
        };

        let mut reconnect = RetryConfig::default();
        if let Some(retries) = get("WHATSVIEW_RECONNECT_RETRIES") {
            reconnect.max_retries = retries
                .parse()
                .map_err(|e: std::num::ParseIntError| invalid("WHATSVIEW_RECONNECT_RETRIES", &retries, &e.to_string()))?;
        }
        if let Some(base) = get("WHATSVIEW_RECONNECT_BASE_MS") {
            let millis: u64 = base
                .parse()
                .map_err(|e: std::num::ParseIntError| invalid("WHATSVIEW_RECONNECT_BASE_MS", &base, &e.to_string()))?;
            reconnect.base_delay = Duration::from_millis(millis);
        }

        Ok(Self {
            backend,
            table,
            summary_strategy,
            list_refresh,
            http_addr,
            reconnect,
        })
    }

    pub fn list_options(&self) -> ListOptions {
        ListOptions {
            table: self.table.clone(),
            strategy: self.summary_strategy,
            refresh: self.list_refresh,
        }
    }
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_or<T>(key: &'static str, value: Option<String>) -> Result<T, ConfigError>
where
    T: FromStr<Err = String> + Default,
{
    match value {
        Some(value) => value.parse().map_err(|reason: String| invalid(key, &value, &reason)),
        None => Ok(T::default()),
    }
}

// The table name ends up in SQL text and URL paths.
fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
