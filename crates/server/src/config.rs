use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    Io,
    Parse,
    Missing,
    Invalid,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io => write!(f, "configuration io failure"),
            Self::Parse => write!(f, "configuration parse failure"),
            Self::Missing => write!(f, "configuration key missing"),
            Self::Invalid => write!(f, "configuration value invalid"),
        }
    }
}

impl Error for ConfigError {}

#[derive(Clone, Debug)]
pub struct TurnConfig {
    pub url: String,
    pub username: String,
    pub credential: String,
}

#[derive(Clone, Debug)]
pub struct RateLimitSettings {
    pub burst: u32,
    pub window: Duration,
    pub penalty: Duration,
}

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    pub http: RateLimitSettings,
    pub connect: RateLimitSettings,
}

#[derive(Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub redis_url: String,
    pub admin_token: Option<String>,
    pub allowed_origins: Vec<String>,
    pub stun_urls: Vec<String>,
    pub turn: Option<TurnConfig>,
    pub presence_ttl_seconds: i64,
    pub rate_limit: RateLimitConfig,
}

impl ServerConfig {
    /// Interval at which a live session refreshes its `route:<id>` record:
    /// half the record's TTL, so one missed refresh still leaves the
    /// connection visible to cluster-wide liveness checks.
    pub fn route_refresh_interval(&self) -> Duration {
        Duration::from_secs((self.presence_ttl_seconds as u64 / 2).max(1))
    }
}

/// Loads server configuration from an optional flat config file with
/// environment overrides. The store URL is the only hard requirement.
pub fn load_configuration(path: &Path) -> Result<ServerConfig, ConfigError> {
    let mut map = HashMap::new();
    if path.exists() {
        let contents = fs::read_to_string(path).map_err(|_| ConfigError::Io)?;
        parse_flat_file(&contents, &mut map)?;
    }

    let bind = override_env("CAROUSEL_BIND", map.remove("server.bind"))?
        .unwrap_or_else(|| "0.0.0.0:8443".to_string());
    let tls_cert = override_env("CAROUSEL_TLS_CERT", map.remove("server.tls_cert"))?;
    let tls_key = override_env("CAROUSEL_TLS_KEY", map.remove("server.tls_key"))?;
    if tls_cert.is_some() != tls_key.is_some() {
        return Err(ConfigError::Invalid);
    }
    let redis_url = required(override_env(
        "CAROUSEL_REDIS_URL",
        map.remove("storage.redis_url"),
    )?)?;
    let admin_token = override_env("CAROUSEL_ADMIN_TOKEN", map.remove("admin.token"))?;
    let allowed_origins = split_list(override_env(
        "CAROUSEL_ALLOWED_ORIGINS",
        map.remove("server.allowed_origins"),
    )?);
    let stun_urls = {
        let parsed = split_list(override_env(
            "CAROUSEL_STUN_URLS",
            map.remove("ice.stun_urls"),
        )?);
        if parsed.is_empty() {
            vec!["stun:stun.l.google.com:19302".to_string()]
        } else {
            parsed
        }
    };
    let turn_url = override_env("CAROUSEL_TURN_URL", map.remove("ice.turn_url"))?;
    let turn_username = override_env("CAROUSEL_TURN_USERNAME", map.remove("ice.turn_username"))?;
    let turn_credential =
        override_env("CAROUSEL_TURN_CREDENTIAL", map.remove("ice.turn_credential"))?;
    let turn = match turn_url {
        Some(url) => {
            let username = turn_username.ok_or(ConfigError::Invalid)?;
            let credential = turn_credential.ok_or(ConfigError::Invalid)?;
            Some(TurnConfig {
                url,
                username,
                credential,
            })
        }
        None => {
            if turn_username.is_some() || turn_credential.is_some() {
                return Err(ConfigError::Invalid);
            }
            None
        }
    };

    let presence_ttl = override_env("CAROUSEL_PRESENCE_TTL", map.remove("limits.presence_ttl"))?
        .unwrap_or_else(|| "30".to_string())
        .parse::<i64>()
        .map_err(|_| ConfigError::Invalid)?;
    if presence_ttl <= 0 {
        return Err(ConfigError::Invalid);
    }

    let rate_limit = RateLimitConfig {
        http: parse_rate_settings(&mut map, "http", 30, 10_000, 30_000)?,
        connect: parse_rate_settings(&mut map, "connect", 5, 10_000, 30_000)?,
    };

    Ok(ServerConfig {
        bind,
        tls_cert,
        tls_key,
        redis_url,
        admin_token,
        allowed_origins,
        stun_urls,
        turn,
        presence_ttl_seconds: presence_ttl,
        rate_limit,
    })
}

fn parse_flat_file(
    contents: &str,
    map: &mut HashMap<String, String>,
) -> Result<(), ConfigError> {
    let mut section = String::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            section = trimmed
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();
            continue;
        }
        let parts: Vec<&str> = trimmed.splitn(2, '=').collect();
        if parts.len() != 2 {
            return Err(ConfigError::Parse);
        }
        let key = if section.is_empty() {
            parts[0].trim().to_string()
        } else {
            format!("{}.{}", section, parts[0].trim())
        };
        let mut value = parts[1].trim().to_string();
        if let Some(idx) = value.find('#') {
            value.truncate(idx);
            value = value.trim().to_string();
        }
        if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
            value = value[1..value.len() - 1].to_string();
        }
        map.insert(key, value);
    }
    Ok(())
}

fn parse_rate_settings(
    map: &mut HashMap<String, String>,
    scope: &str,
    default_burst: u32,
    default_window_ms: u64,
    default_penalty_ms: u64,
) -> Result<RateLimitSettings, ConfigError> {
    let upper = scope.to_ascii_uppercase();
    let burst = override_env(
        &format!("CAROUSEL_{}_BURST", upper),
        map.remove(&format!("limits.{}_burst", scope)),
    )?
    .map(|v| v.parse::<u32>())
    .transpose()
    .map_err(|_| ConfigError::Invalid)?
    .unwrap_or(default_burst);
    let window_ms = override_env(
        &format!("CAROUSEL_{}_WINDOW_MS", upper),
        map.remove(&format!("limits.{}_window_ms", scope)),
    )?
    .map(|v| v.parse::<u64>())
    .transpose()
    .map_err(|_| ConfigError::Invalid)?
    .unwrap_or(default_window_ms);
    let penalty_ms = override_env(
        &format!("CAROUSEL_{}_PENALTY_MS", upper),
        map.remove(&format!("limits.{}_penalty_ms", scope)),
    )?
    .map(|v| v.parse::<u64>())
    .transpose()
    .map_err(|_| ConfigError::Invalid)?
    .unwrap_or(default_penalty_ms);
    if burst == 0 || window_ms == 0 {
        return Err(ConfigError::Invalid);
    }
    Ok(RateLimitSettings {
        burst,
        window: Duration::from_millis(window_ms),
        penalty: Duration::from_millis(penalty_ms),
    })
}

fn override_env(key: &str, current: Option<String>) -> Result<Option<String>, ConfigError> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(current),
        Err(_) => Err(ConfigError::Invalid),
    }
}

fn required(value: Option<String>) -> Result<String, ConfigError> {
    value.ok_or(ConfigError::Missing)
}

fn split_list(raw: Option<String>) -> Vec<String> {
    raw.map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    fn write_config(name: &str, contents: &[u8]) -> PathBuf {
        let mut path = PathBuf::from(env::temp_dir());
        path.push(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        path
    }

    #[test]
    fn parse_configuration_minimal() {
        let path = write_config(
            "carousel_test_config.toml",
            b"[server]\nbind=\"127.0.0.1:9443\"\n[storage]\nredis_url=\"redis://localhost\"\n",
        );
        let config = load_configuration(&path).unwrap();
        assert_eq!(config.bind, "127.0.0.1:9443");
        assert_eq!(config.redis_url, "redis://localhost");
        assert!(config.admin_token.is_none());
        assert!(config.turn.is_none());
        assert_eq!(config.presence_ttl_seconds, 30);
        assert_eq!(config.stun_urls, vec!["stun:stun.l.google.com:19302"]);
        assert_eq!(config.rate_limit.connect.burst, 5);
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn parse_configuration_full() {
        let path = write_config(
            "carousel_test_config_full.toml",
            b"[server]\nbind=\"0.0.0.0:8443\"\nallowed_origins=\"https://carousel.example, https://app.carousel.example\"\n[storage]\nredis_url=\"redis://cache:6379/0\"\n[admin]\ntoken=\"sekrit\"\n[ice]\nstun_urls=\"stun:stun.example:3478\"\nturn_url=\"turn:turn.example:3478\"\nturn_username=\"user\"\nturn_credential=\"pass\"\n[limits]\npresence_ttl=\"60\"\nconnect_burst=\"3\"\n",
        );
        let config = load_configuration(&path).unwrap();
        assert_eq!(config.allowed_origins.len(), 2);
        assert_eq!(config.admin_token.as_deref(), Some("sekrit"));
        let turn = config.turn.expect("turn configured");
        assert_eq!(turn.url, "turn:turn.example:3478");
        assert_eq!(config.presence_ttl_seconds, 60);
        assert_eq!(config.route_refresh_interval(), Duration::from_secs(30));
        assert_eq!(config.rate_limit.connect.burst, 3);
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn route_refresh_never_reaches_the_ttl() {
        let path = write_config(
            "carousel_test_config_refresh.toml",
            b"[storage]\nredis_url=\"redis://localhost\"\n[limits]\npresence_ttl=\"1\"\n",
        );
        let config = load_configuration(&path).unwrap();
        assert_eq!(config.route_refresh_interval(), Duration::from_secs(1));
        assert!(config.route_refresh_interval() <= Duration::from_secs(config.presence_ttl_seconds as u64));
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn missing_store_url_is_fatal() {
        let path = write_config(
            "carousel_test_config_nostore.toml",
            b"[server]\nbind=\"127.0.0.1:9443\"\n",
        );
        assert!(matches!(
            load_configuration(&path),
            Err(ConfigError::Missing)
        ));
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn partial_turn_credentials_are_invalid() {
        let path = write_config(
            "carousel_test_config_turn.toml",
            b"[storage]\nredis_url=\"redis://localhost\"\n[ice]\nturn_url=\"turn:turn.example:3478\"\n",
        );
        assert!(matches!(
            load_configuration(&path),
            Err(ConfigError::Invalid)
        ));
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn one_sided_tls_is_invalid() {
        let path = write_config(
            "carousel_test_config_tls.toml",
            b"[server]\ntls_cert=\"cert.pem\"\n[storage]\nredis_url=\"redis://localhost\"\n",
        );
        assert!(matches!(
            load_configuration(&path),
            Err(ConfigError::Invalid)
        ));
        fs::remove_file(path).unwrap();
    }
}
