//! Configuration handling for the persistence layer.
//!
//! Configuration-property loading lives outside this crate; everything here is
//! consumed through the [`PropertySource`] trait ("give me a typed property").
//! Data sources are defined by URL, with pool options either read from
//! `pool.*` properties or embedded as URL query parameters that are extracted
//! and stripped before the URL reaches the driver.

use crate::db::dialect::DialectKind;
use crate::error::{StoreError, StoreResult};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

// Pool configuration defaults. Zero eager connections so the absence of a
// live database at boot does not itself fail startup.
pub const DEFAULT_INITIAL_SIZE: u32 = 0;
pub const DEFAULT_MIN_SIZE: u32 = 0;
pub const DEFAULT_MAX_SIZE: u32 = 20;
pub const DEFAULT_CAN_GROW: bool = true;
pub const DEFAULT_WAIT_PERIOD_SECS: u64 = 10;
pub const DEFAULT_RETRY_PERIOD_MS: u64 = 1_000;
pub const DEFAULT_RETRY_COUNT: u32 = 5;
pub const DEFAULT_IDLE_PERIOD_SECS: u64 = 600;
pub const DEFAULT_IDLE_CHECK_PERIOD_SECS: u64 = 300;
pub const DEFAULT_IDLE_CHECK_SIZE: u32 = 5;
pub const DEFAULT_PSTMT_CACHE_SIZE: u32 = 100;

/// Hard cap a growable pool may expand to under load. sqlx pools are bounded,
/// so `pool.cangrow=true` is modeled as this raised ceiling rather than truly
/// unbounded growth.
pub const GROW_CEILING: u32 = 512;

/// Typed property access, implemented by the host's configuration loader.
pub trait PropertySource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn get_u32(&self, key: &str) -> Option<u32> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(|v| {
            if v.eq_ignore_ascii_case("true") {
                Some(true)
            } else if v.eq_ignore_ascii_case("false") {
                Some(false)
            } else {
                None
            }
        })
    }
}

impl PropertySource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

/// Connection pool configuration for one data source.
///
/// All fields are optional; the `*_or_default` accessors apply the documented
/// defaults. `validate.level`, `idlecheckperiod` and `idlechecksize` are
/// accepted for configuration compatibility and exposed, but the sqlx pool
/// revalidates on borrow and retires connections past the idle period itself,
/// so they have no separate runtime effect.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct PoolSettings {
    pub initial_size: Option<u32>,
    pub min_size: Option<u32>,
    pub max_size: Option<u32>,
    pub can_grow: Option<bool>,
    pub wait_period_secs: Option<u64>,
    pub retry_period_ms: Option<u64>,
    pub retry_count: Option<u32>,
    pub validate_on_borrow: Option<bool>,
    pub validate_on_return: Option<bool>,
    pub validate_on_idle: Option<bool>,
    pub validate_level: Option<u8>,
    pub idle_check_period_secs: Option<u64>,
    pub idle_check_size: Option<u32>,
    pub idle_period_secs: Option<u64>,
    pub pstmt_cache_size: Option<u32>,
}

impl PoolSettings {
    /// Read pool settings from properties. Keys are looked up first with the
    /// given prefix (e.g. `orders.pool.maxsize`), then bare (`pool.maxsize`),
    /// so one global policy can be overridden per data source.
    pub fn from_properties(props: &dyn PropertySource, prefix: &str) -> Self {
        let key = |suffix: &str| -> (String, String) {
            (format!("{prefix}pool.{suffix}"), format!("pool.{suffix}"))
        };
        let u32_of = |suffix: &str| {
            let (scoped, bare) = key(suffix);
            props.get_u32(&scoped).or_else(|| props.get_u32(&bare))
        };
        let u64_of = |suffix: &str| {
            let (scoped, bare) = key(suffix);
            props.get_u64(&scoped).or_else(|| props.get_u64(&bare))
        };
        let bool_of = |suffix: &str| {
            let (scoped, bare) = key(suffix);
            props.get_bool(&scoped).or_else(|| props.get_bool(&bare))
        };

        Self {
            initial_size: u32_of("initialsize"),
            min_size: u32_of("minsize"),
            max_size: u32_of("maxsize"),
            can_grow: bool_of("cangrow"),
            wait_period_secs: u64_of("waitperiod"),
            retry_period_ms: u64_of("retryperiod"),
            retry_count: u32_of("retrycount"),
            validate_on_borrow: bool_of("validate.borrow"),
            validate_on_return: bool_of("validate.return"),
            validate_on_idle: bool_of("validate.idle"),
            validate_level: u32_of("validate.level").map(|v| v.min(u8::MAX as u32) as u8),
            idle_check_period_secs: u64_of("idlecheckperiod"),
            idle_check_size: u32_of("idlechecksize"),
            idle_period_secs: u64_of("idleperiod"),
            pstmt_cache_size: u32_of("pstmtcachesize"),
        }
    }

    pub fn initial_size_or_default(&self) -> u32 {
        self.initial_size.unwrap_or(DEFAULT_INITIAL_SIZE)
    }

    pub fn min_size_or_default(&self) -> u32 {
        self.min_size.unwrap_or(DEFAULT_MIN_SIZE)
    }

    pub fn max_size_or_default(&self) -> u32 {
        self.max_size.unwrap_or(DEFAULT_MAX_SIZE)
    }

    pub fn can_grow_or_default(&self) -> bool {
        self.can_grow.unwrap_or(DEFAULT_CAN_GROW)
    }

    /// The hard connection cap handed to the pool: `maxsize` when growth is
    /// disabled, the growth ceiling otherwise.
    pub fn effective_max(&self) -> u32 {
        if self.can_grow_or_default() {
            self.max_size_or_default().max(GROW_CEILING)
        } else {
            self.max_size_or_default()
        }
    }

    pub fn wait_period(&self) -> Duration {
        Duration::from_secs(self.wait_period_secs.unwrap_or(DEFAULT_WAIT_PERIOD_SECS))
    }

    pub fn retry_period(&self) -> Duration {
        Duration::from_millis(self.retry_period_ms.unwrap_or(DEFAULT_RETRY_PERIOD_MS))
    }

    pub fn retry_count_or_default(&self) -> u32 {
        self.retry_count.unwrap_or(DEFAULT_RETRY_COUNT)
    }

    pub fn validate_on_borrow_or_default(&self) -> bool {
        self.validate_on_borrow.unwrap_or(true)
    }

    pub fn idle_period(&self) -> Duration {
        Duration::from_secs(self.idle_period_secs.unwrap_or(DEFAULT_IDLE_PERIOD_SECS))
    }

    pub fn pstmt_cache_size_or_default(&self) -> u32 {
        self.pstmt_cache_size.unwrap_or(DEFAULT_PSTMT_CACHE_SIZE)
    }

    /// Validate pool settings and return an error message if inconsistent.
    pub fn validate(&self) -> Result<(), String> {
        let max = self.max_size_or_default();
        if max == 0 {
            return Err("pool.maxsize must be greater than 0".to_string());
        }
        if self.min_size_or_default() > max {
            return Err(format!(
                "pool.minsize ({}) cannot exceed pool.maxsize ({})",
                self.min_size_or_default(),
                max
            ));
        }
        if self.initial_size_or_default() > max {
            return Err(format!(
                "pool.initialsize ({}) cannot exceed pool.maxsize ({})",
                self.initial_size_or_default(),
                max
            ));
        }
        Ok(())
    }
}

/// Transaction isolation level requested for a data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "read_uncommitted" => Some(Self::ReadUncommitted),
            "read_committed" => Some(Self::ReadCommitted),
            "repeatable_read" => Some(Self::RepeatableRead),
            "serializable" => Some(Self::Serializable),
            _ => None,
        }
    }

    /// SQL spelling shared by the server engines.
    pub fn sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

/// Definition of one named data source.
#[derive(Debug, Clone)]
pub struct DataSourceConfig {
    /// Name other components use to acquire connections.
    pub name: String,
    /// Driver URL, stripped of relstore-specific query parameters.
    pub url: String,
    /// Backend kind derived from the URL scheme.
    pub kind: DialectKind,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Elevated credentials for schema-creation connections.
    pub admin_user: Option<String>,
    pub admin_password: Option<String>,
    pub isolation: Option<IsolationLevel>,
    pub pool: PoolSettings,
}

impl DataSourceConfig {
    /// Pool option keys recognized as URL query parameters.
    const URL_OPTION_KEYS: &'static [&'static str] = &[
        "pool.initialsize",
        "pool.minsize",
        "pool.maxsize",
        "pool.cangrow",
        "pool.waitperiod",
        "pool.retryperiod",
        "pool.retrycount",
        "pool.validate.borrow",
        "pool.validate.return",
        "pool.validate.idle",
        "pool.validate.level",
        "pool.idlecheckperiod",
        "pool.idlechecksize",
        "pool.idleperiod",
        "pool.pstmtcachesize",
        "isolation",
    ];

    /// Parse a data source definition from a URL.
    ///
    /// relstore options may ride along as query parameters and are stripped;
    /// every other parameter is preserved for the driver.
    ///
    /// ```text
    /// postgres://app:secret@db:5432/orders?pool.maxsize=5&sslmode=require
    /// sqlite:/var/data/orders.db?pool.maxsize=1&pool.cangrow=false
    /// ```
    pub fn parse(name: &str, url_str: &str) -> StoreResult<Self> {
        if name.trim().is_empty() {
            return Err(StoreError::configuration(
                "Data source name must not be empty",
            ));
        }

        let mut url = Url::parse(url_str)
            .map_err(|e| StoreError::configuration(format!("Invalid URL for '{name}': {e}")))?;

        let kind = DialectKind::from_scheme(url.scheme()).ok_or_else(|| {
            StoreError::configuration(format!(
                "Unsupported URL scheme '{}' for data source '{name}'",
                url.scheme()
            ))
        })?;

        let mut opts = Self::extract_options(&mut url, Self::URL_OPTION_KEYS);
        let isolation = opts.remove("isolation").and_then(|v| IsolationLevel::parse(&v));
        let pool = Self::pool_from_options(&opts);
        pool.validate().map_err(StoreError::configuration)?;

        Ok(Self {
            name: name.to_string(),
            url: url.to_string(),
            kind,
            user: None,
            password: None,
            admin_user: None,
            admin_password: None,
            isolation,
            pool,
        })
    }

    /// Read a full data source definition from properties:
    /// `<name>.url`, `<name>.user`, `<name>.password`, `<name>.admin.user`,
    /// `<name>.admin.password`, `<name>.isolation`, plus `pool.*` keys
    /// (scoped `<name>.pool.*` wins over bare `pool.*`).
    pub fn from_properties(name: &str, props: &dyn PropertySource) -> StoreResult<Self> {
        let url = props
            .get(&format!("{name}.url"))
            .ok_or_else(|| StoreError::configuration(format!("Missing property '{name}.url'")))?;

        let mut config = Self::parse(name, &url)?;
        config.user = props.get(&format!("{name}.user"));
        config.password = props.get(&format!("{name}.password"));
        config.admin_user = props.get(&format!("{name}.admin.user"));
        config.admin_password = props.get(&format!("{name}.admin.password"));
        if let Some(iso) = props.get(&format!("{name}.isolation")) {
            config.isolation = IsolationLevel::parse(&iso);
        }

        // URL-embedded options beat property-file ones only where set.
        let from_props = PoolSettings::from_properties(props, &format!("{name}."));
        config.pool = merge_pool_settings(config.pool, from_props);
        config.pool.validate().map_err(StoreError::configuration)?;
        Ok(config)
    }

    fn pool_from_options(opts: &HashMap<String, String>) -> PoolSettings {
        let parse_u32 = |k: &str| opts.get(k).and_then(|v| v.parse().ok());
        let parse_u64 = |k: &str| opts.get(k).and_then(|v| v.parse().ok());
        let parse_bool = |k: &str| {
            opts.get(k).and_then(|v| {
                if v.eq_ignore_ascii_case("true") {
                    Some(true)
                } else if v.eq_ignore_ascii_case("false") {
                    Some(false)
                } else {
                    None
                }
            })
        };

        PoolSettings {
            initial_size: parse_u32("pool.initialsize"),
            min_size: parse_u32("pool.minsize"),
            max_size: parse_u32("pool.maxsize"),
            can_grow: parse_bool("pool.cangrow"),
            wait_period_secs: parse_u64("pool.waitperiod"),
            retry_period_ms: parse_u64("pool.retryperiod"),
            retry_count: parse_u32("pool.retrycount"),
            validate_on_borrow: parse_bool("pool.validate.borrow"),
            validate_on_return: parse_bool("pool.validate.return"),
            validate_on_idle: parse_bool("pool.validate.idle"),
            validate_level: parse_u32("pool.validate.level").map(|v| v.min(u8::MAX as u32) as u8),
            idle_check_period_secs: parse_u64("pool.idlecheckperiod"),
            idle_check_size: parse_u32("pool.idlechecksize"),
            idle_period_secs: parse_u64("pool.idleperiod"),
            pstmt_cache_size: parse_u32("pool.pstmtcachesize"),
        }
    }

    /// Extract relstore-specific options from URL query params, keeping others
    /// for the driver. Uses proper URL encoding to preserve special characters
    /// in remaining params.
    fn extract_options(url: &mut Url, keys: &[&str]) -> HashMap<String, String> {
        let mut opts = HashMap::new();
        let remaining: Vec<(String, String)> = url
            .query_pairs()
            .filter_map(|(k, v)| {
                let key_lower = k.to_ascii_lowercase();
                if keys.contains(&key_lower.as_str()) {
                    opts.insert(key_lower, v.into_owned());
                    None
                } else {
                    Some((k.into_owned(), v.into_owned()))
                }
            })
            .collect();

        if remaining.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(remaining);
        }
        opts
    }
}

/// Merge two pool settings, preferring fields set in `primary`.
fn merge_pool_settings(primary: PoolSettings, secondary: PoolSettings) -> PoolSettings {
    PoolSettings {
        initial_size: primary.initial_size.or(secondary.initial_size),
        min_size: primary.min_size.or(secondary.min_size),
        max_size: primary.max_size.or(secondary.max_size),
        can_grow: primary.can_grow.or(secondary.can_grow),
        wait_period_secs: primary.wait_period_secs.or(secondary.wait_period_secs),
        retry_period_ms: primary.retry_period_ms.or(secondary.retry_period_ms),
        retry_count: primary.retry_count.or(secondary.retry_count),
        validate_on_borrow: primary.validate_on_borrow.or(secondary.validate_on_borrow),
        validate_on_return: primary.validate_on_return.or(secondary.validate_on_return),
        validate_on_idle: primary.validate_on_idle.or(secondary.validate_on_idle),
        validate_level: primary.validate_level.or(secondary.validate_level),
        idle_check_period_secs: primary
            .idle_check_period_secs
            .or(secondary.idle_check_period_secs),
        idle_check_size: primary.idle_check_size.or(secondary.idle_check_size),
        idle_period_secs: primary.idle_period_secs.or(secondary.idle_period_secs),
        pstmt_cache_size: primary.pstmt_cache_size.or(secondary.pstmt_cache_size),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_pool_settings_defaults() {
        let settings = PoolSettings::default();
        assert_eq!(settings.initial_size_or_default(), 0);
        assert_eq!(settings.min_size_or_default(), 0);
        assert_eq!(settings.max_size_or_default(), 20);
        assert!(settings.can_grow_or_default());
        assert_eq!(settings.wait_period(), Duration::from_secs(10));
        assert_eq!(settings.retry_count_or_default(), 5);
        assert!(settings.validate_on_borrow_or_default());
        assert_eq!(settings.pstmt_cache_size_or_default(), 100);
    }

    #[test]
    fn test_effective_max_growable() {
        let settings = PoolSettings {
            max_size: Some(20),
            can_grow: Some(true),
            ..Default::default()
        };
        assert_eq!(settings.effective_max(), GROW_CEILING);
    }

    #[test]
    fn test_effective_max_fixed() {
        let settings = PoolSettings {
            max_size: Some(5),
            can_grow: Some(false),
            ..Default::default()
        };
        assert_eq!(settings.effective_max(), 5);
    }

    #[test]
    fn test_pool_settings_from_properties() {
        let p = props(&[
            ("pool.maxsize", "8"),
            ("pool.cangrow", "false"),
            ("pool.waitperiod", "3"),
            ("pool.validate.borrow", "false"),
        ]);
        let settings = PoolSettings::from_properties(&p, "");
        assert_eq!(settings.max_size, Some(8));
        assert_eq!(settings.can_grow, Some(false));
        assert_eq!(settings.wait_period_secs, Some(3));
        assert_eq!(settings.validate_on_borrow, Some(false));
        assert!(settings.min_size.is_none());
    }

    #[test]
    fn test_pool_settings_scoped_override() {
        let p = props(&[("pool.maxsize", "20"), ("orders.pool.maxsize", "4")]);
        let scoped = PoolSettings::from_properties(&p, "orders.");
        assert_eq!(scoped.max_size, Some(4));
        let bare = PoolSettings::from_properties(&p, "billing.");
        assert_eq!(bare.max_size, Some(20));
    }

    #[test]
    fn test_pool_settings_validation() {
        let bad = PoolSettings {
            min_size: Some(10),
            max_size: Some(5),
            ..Default::default()
        };
        assert!(bad.validate().unwrap_err().contains("minsize"));

        let zero = PoolSettings {
            max_size: Some(0),
            ..Default::default()
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_isolation_parse() {
        assert_eq!(
            IsolationLevel::parse("read committed"),
            Some(IsolationLevel::ReadCommitted)
        );
        assert_eq!(
            IsolationLevel::parse("REPEATABLE_READ"),
            Some(IsolationLevel::RepeatableRead)
        );
        assert_eq!(
            IsolationLevel::parse("serializable"),
            Some(IsolationLevel::Serializable)
        );
        assert!(IsolationLevel::parse("chaotic").is_none());
    }

    #[test]
    fn test_parse_kind_from_scheme() {
        let pg = DataSourceConfig::parse("orders", "postgres://u:p@host:5432/orders").unwrap();
        assert_eq!(pg.kind, DialectKind::Postgres);
        let my = DataSourceConfig::parse("orders", "mysql://u:p@host:3306/orders").unwrap();
        assert_eq!(my.kind, DialectKind::MySql);
        let lite = DataSourceConfig::parse("orders", "sqlite:/tmp/orders.db").unwrap();
        assert_eq!(lite.kind, DialectKind::Sqlite);
    }

    #[test]
    fn test_parse_rejects_unknown_scheme() {
        let result = DataSourceConfig::parse("orders", "oracle://host/db");
        assert!(matches!(result, Err(StoreError::Configuration { .. })));
    }

    #[test]
    fn test_parse_strips_pool_options_from_url() {
        let config = DataSourceConfig::parse(
            "orders",
            "postgres://host/orders?pool.maxsize=5&sslmode=require&pool.cangrow=false",
        )
        .unwrap();
        assert_eq!(config.pool.max_size, Some(5));
        assert_eq!(config.pool.can_grow, Some(false));
        assert!(config.url.contains("sslmode=require"));
        assert!(!config.url.contains("pool.maxsize"));
        assert!(!config.url.contains("pool.cangrow"));
    }

    #[test]
    fn test_parse_isolation_from_url() {
        let config = DataSourceConfig::parse(
            "orders",
            "mysql://host/orders?isolation=repeatable_read",
        )
        .unwrap();
        assert_eq!(config.isolation, Some(IsolationLevel::RepeatableRead));
        assert!(!config.url.contains("isolation"));
    }

    #[test]
    fn test_parse_invalid_pool_value_ignored() {
        let config =
            DataSourceConfig::parse("orders", "mysql://host/orders?pool.maxsize=lots").unwrap();
        assert!(config.pool.max_size.is_none());
    }

    #[test]
    fn test_from_properties_full_definition() {
        let p = props(&[
            ("orders.url", "postgres://db:5432/orders"),
            ("orders.user", "app"),
            ("orders.password", "secret"),
            ("orders.admin.user", "dba"),
            ("orders.admin.password", "super"),
            ("orders.isolation", "serializable"),
            ("orders.pool.maxsize", "6"),
            ("pool.waitperiod", "4"),
        ]);
        let config = DataSourceConfig::from_properties("orders", &p).unwrap();
        assert_eq!(config.user.as_deref(), Some("app"));
        assert_eq!(config.admin_user.as_deref(), Some("dba"));
        assert_eq!(config.isolation, Some(IsolationLevel::Serializable));
        assert_eq!(config.pool.max_size, Some(6));
        assert_eq!(config.pool.wait_period_secs, Some(4));
    }

    #[test]
    fn test_from_properties_missing_url() {
        let p = props(&[("orders.user", "app")]);
        let result = DataSourceConfig::from_properties("orders", &p);
        assert!(matches!(result, Err(StoreError::Configuration { .. })));
    }

    #[test]
    fn test_url_option_beats_property() {
        let p = props(&[
            ("orders.url", "postgres://db/orders?pool.maxsize=3"),
            ("orders.pool.maxsize", "9"),
        ]);
        let config = DataSourceConfig::from_properties("orders", &p).unwrap();
        assert_eq!(config.pool.max_size, Some(3));
    }
}
