use regex::Regex;
use std::env;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub env_name: String,

    pub host: String,
    pub port: u16,

    pub max_body_bytes: usize,

    pub store_backend: StoreBackend,
    pub db_url: String,
    pub db_schema: Option<String>,
    pub store_timeout: Duration,

    pub jwt_secret: String,
    pub access_ttl_secs: i64,
    pub refresh_ttl_secs: i64,
    pub rotate_refresh: bool,

    pub internal_secret: Option<String>,

    pub allowed_origins: Vec<String>,

    pub max_ciphertext_bytes: usize,
    pub max_recipients: usize,
    pub event_buffer: usize,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(v) => {
            let v = v.trim().to_string();
            if v.is_empty() {
                None
            } else {
                Some(v)
            }
        }
        Err(_) => None,
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn parse_num<T: std::str::FromStr>(key: &str, default: &str) -> Result<T, String> {
    env_or(key, default)
        .trim()
        .parse()
        .map_err(|_| format!("{key} must be an integer"))
}

fn normalize_db_url(raw: &str) -> String {
    // Accept SQLAlchemy-style URLs like "postgresql+psycopg://..." by dropping
    // the "+driver" portion.
    if let Some(colon) = raw.find(':') {
        let (scheme, rest) = raw.split_at(colon);
        if let Some(plus) = scheme.find('+') {
            return format!("{}{}", &scheme[..plus], rest);
        }
    }
    raw.to_string()
}

fn validate_postgres_url(url: &str) -> Result<(), String> {
    let scheme = url
        .split_once(':')
        .map(|(s, _)| s.trim().to_lowercase())
        .unwrap_or_default();
    match scheme.as_str() {
        "postgres" | "postgresql" => Ok(()),
        _ => Err("RELAY_DB_URL (or DB_URL) must be a postgres URL".to_string()),
    }
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    let v = raw.trim().to_lowercase();
    if v.is_empty() {
        return None;
    }
    Some(!matches!(v.as_str(), "0" | "false" | "no" | "off"))
}

fn is_production_like(env_lower: &str) -> bool {
    matches!(env_lower, "prod" | "production" | "staging")
}

fn looks_like_placeholder(secret: &str) -> bool {
    let s = secret.trim().to_ascii_lowercase();
    ["change-me", "changeme", "replace-me", "secret", "password", "example", "dummy"]
        .iter()
        .any(|v| s == *v || s.starts_with(v))
}

/// Signing and shared secrets: required and strong in prod/staging, free-form
/// elsewhere.
fn check_secret(prod_like: bool, key: &str, value: Option<&str>, min_len: usize) -> Result<(), String> {
    if !prod_like {
        return Ok(());
    }
    let Some(secret) = value.map(str::trim).filter(|s| !s.is_empty()) else {
        return Err(format!("{key} must be set in prod/staging"));
    };
    if secret.len() < min_len {
        return Err(format!(
            "{key} must be at least {min_len} characters in prod/staging"
        ));
    }
    if looks_like_placeholder(secret) {
        return Err(format!(
            "{key} looks like a placeholder value; use a strong random secret"
        ));
    }
    Ok(())
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let env_name = env_or("ENV", "dev");
        let env_lower = env_name.trim().to_lowercase();
        let prod_like = is_production_like(&env_lower);

        let host = env_or("APP_HOST", "0.0.0.0");
        let port: u16 = env_or("APP_PORT", "8090")
            .parse()
            .map_err(|_| "APP_PORT must be a valid u16".to_string())?;

        let store_backend = match env_or("RELAY_STORE", "postgres").trim().to_lowercase().as_str() {
            "postgres" | "postgresql" => StoreBackend::Postgres,
            "memory" => StoreBackend::Memory,
            other => return Err(format!("RELAY_STORE must be postgres or memory, got {other}")),
        };
        if store_backend == StoreBackend::Memory && !matches!(env_lower.as_str(), "dev" | "test") {
            return Err("RELAY_STORE=memory is only allowed in dev/test".to_string());
        }

        let db_raw = env_opt("RELAY_DB_URL")
            .or_else(|| env_opt("DB_URL"))
            .unwrap_or_else(|| "postgresql://relay:relay@db:5432/relay".to_string());
        let db_url = normalize_db_url(&db_raw);
        if store_backend == StoreBackend::Postgres {
            validate_postgres_url(&db_url)?;
        }

        let db_schema = env_opt("DB_SCHEMA");
        if let Some(s) = &db_schema {
            let re = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").map_err(|e| e.to_string())?;
            if !re.is_match(s) {
                return Err("DB_SCHEMA must match ^[A-Za-z_][A-Za-z0-9_]*$".to_string());
            }
        }

        let store_timeout_ms: u64 = parse_num("RELAY_STORE_TIMEOUT_MS", "5000")?;
        let store_timeout = Duration::from_millis(store_timeout_ms.clamp(100, 60_000));

        let jwt_secret = match env_opt("RELAY_JWT_SECRET") {
            Some(s) => s,
            None if !prod_like => "dev-only-relay-signing-key-not-for-production".to_string(),
            None => return Err("RELAY_JWT_SECRET must be set in prod/staging".to_string()),
        };
        check_secret(prod_like, "RELAY_JWT_SECRET", Some(jwt_secret.as_str()), 32)?;

        let access_ttl_secs: i64 = parse_num::<i64>("RELAY_ACCESS_TTL_SECS", "900")?.clamp(60, 3600);
        let refresh_ttl_secs: i64 =
            parse_num::<i64>("RELAY_REFRESH_TTL_SECS", "2592000")?.clamp(3600, 90 * 24 * 3600);
        let rotate_refresh = parse_bool_like(&env_or("RELAY_ROTATE_REFRESH", "")).unwrap_or(true);

        let internal_secret =
            env_opt("INTERNAL_API_SECRET").or_else(|| env_opt("RELAY_INTERNAL_SECRET"));
        check_secret(prod_like, "INTERNAL_API_SECRET", internal_secret.as_deref(), 16)?;

        let mut allowed_origins = parse_csv(&env_or("ALLOWED_ORIGINS", ""));
        if allowed_origins.is_empty() {
            allowed_origins = vec![
                "http://localhost:5173".to_string(),
                "http://127.0.0.1:5173".to_string(),
            ];
        }
        if prod_like && allowed_origins.iter().any(|o| o.trim() == "*") {
            return Err("ALLOWED_ORIGINS must not contain '*' in prod/staging".to_string());
        }

        let max_body_bytes: usize = parse_num::<usize>("RELAY_MAX_BODY_BYTES", "1048576")?
            .clamp(16 * 1024, 10 * 1024 * 1024);
        let max_ciphertext_bytes: usize =
            parse_num::<usize>("RELAY_MAX_CIPHERTEXT_BYTES", "262144")?.clamp(1024, max_body_bytes);
        let max_recipients: usize = parse_num::<usize>("RELAY_MAX_RECIPIENTS", "1024")?.clamp(1, 10_000);
        let event_buffer: usize = parse_num::<usize>("RELAY_EVENT_BUFFER", "64")?.clamp(4, 4096);

        Ok(Self {
            env_name,
            host,
            port,
            max_body_bytes,
            store_backend,
            db_url,
            db_schema,
            store_timeout,
            jwt_secret,
            access_ttl_secs,
            refresh_ttl_secs,
            rotate_refresh,
            internal_secret,
            allowed_origins,
            max_ciphertext_bytes,
            max_recipients,
            event_buffer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    const KEYS: &[&str] = &[
        "ENV",
        "RELAY_STORE",
        "RELAY_DB_URL",
        "DB_URL",
        "DB_SCHEMA",
        "RELAY_STORE_TIMEOUT_MS",
        "RELAY_JWT_SECRET",
        "RELAY_ACCESS_TTL_SECS",
        "RELAY_REFRESH_TTL_SECS",
        "RELAY_ROTATE_REFRESH",
        "INTERNAL_API_SECRET",
        "RELAY_INTERNAL_SECRET",
        "ALLOWED_ORIGINS",
        "RELAY_MAX_BODY_BYTES",
        "RELAY_MAX_CIPHERTEXT_BYTES",
        "RELAY_MAX_RECIPIENTS",
        "RELAY_EVENT_BUFFER",
    ];

    struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            let mut saved = Vec::with_capacity(KEYS.len());
            for k in KEYS {
                saved.push((k.to_string(), env::var(k).ok()));
                env::remove_var(k);
            }
            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (k, v) in self.saved.drain(..) {
                match v {
                    Some(val) => env::set_var(k, val),
                    None => env::remove_var(k),
                }
            }
        }
    }

    fn lock() -> std::sync::MutexGuard<'static, ()> {
        ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn dev_defaults_are_usable() {
        let _g = lock();
        let _env = EnvGuard::new();
        let cfg = Config::from_env().expect("dev config");
        assert_eq!(cfg.store_backend, StoreBackend::Postgres);
        assert_eq!(cfg.access_ttl_secs, 900);
        assert_eq!(cfg.refresh_ttl_secs, 2_592_000);
        assert!(cfg.rotate_refresh);
        assert_eq!(cfg.store_timeout, Duration::from_millis(5000));
    }

    #[test]
    fn rejects_non_postgres_url() {
        let _g = lock();
        let _env = EnvGuard::new();
        env::set_var("RELAY_DB_URL", "sqlite:////tmp/relay.db");
        let err = Config::from_env().expect_err("sqlite must be rejected");
        assert!(err.contains("postgres"), "{err}");
    }

    #[test]
    fn normalizes_driver_suffix() {
        let _g = lock();
        let _env = EnvGuard::new();
        env::set_var("DB_URL", "postgresql+psycopg://u:p@h:5432/db");
        let cfg = Config::from_env().expect("config");
        assert_eq!(cfg.db_url, "postgresql://u:p@h:5432/db");
    }

    #[test]
    fn memory_store_is_dev_only() {
        let _g = lock();
        let _env = EnvGuard::new();
        env::set_var("RELAY_STORE", "memory");
        assert!(Config::from_env().is_ok());

        env::set_var("ENV", "prod");
        env::set_var("RELAY_JWT_SECRET", "k3Jd9_QpX2vL8mN4tR7wY1zB6cF0hG5s");
        env::set_var("INTERNAL_API_SECRET", "p9s7Qk_4w-vN2xT8kP6m");
        env::set_var("ALLOWED_ORIGINS", "https://relay.example.org");
        let err = Config::from_env().expect_err("memory in prod");
        assert!(err.contains("RELAY_STORE"), "{err}");
    }

    #[test]
    fn prod_requires_strong_secrets() {
        let _g = lock();
        let _env = EnvGuard::new();
        env::set_var("ENV", "prod");
        env::set_var("ALLOWED_ORIGINS", "https://relay.example.org");
        env::set_var("INTERNAL_API_SECRET", "p9s7Qk_4w-vN2xT8kP6m");

        let err = Config::from_env().expect_err("missing jwt secret");
        assert!(err.contains("RELAY_JWT_SECRET"), "{err}");

        env::set_var("RELAY_JWT_SECRET", "short");
        assert!(Config::from_env().is_err());

        env::set_var("RELAY_JWT_SECRET", "change-me-change-me-change-me-change-me");
        assert!(Config::from_env().is_err());

        env::set_var("RELAY_JWT_SECRET", "k3Jd9_QpX2vL8mN4tR7wY1zB6cF0hG5s");
        assert!(Config::from_env().is_ok());
    }

    #[test]
    fn rotation_can_be_disabled_and_ttls_are_clamped() {
        let _g = lock();
        let _env = EnvGuard::new();
        env::set_var("RELAY_ROTATE_REFRESH", "false");
        env::set_var("RELAY_ACCESS_TTL_SECS", "5");
        let cfg = Config::from_env().expect("config");
        assert!(!cfg.rotate_refresh);
        assert_eq!(cfg.access_ttl_secs, 60);
    }
}
