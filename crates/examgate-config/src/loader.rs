use super::{AppConfig, ConfigError, Result};
use config::{Config, Environment, File};
use std::path::{Path, PathBuf};

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "examgate.toml";

/// Load, merge and validate the application configuration.
///
/// Sources in increasing priority: the TOML file (skipped if it does not
/// exist), then `EXAMGATE__SECTION__KEY` environment variables.
pub fn load_config(path: Option<&str>) -> Result<AppConfig> {
    let mut builder = Config::builder();
    let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));
    if pathbuf.exists() {
        builder = builder.add_source(File::from(pathbuf));
    } else {
        tracing::debug!(path = %pathbuf.display(), "config file not found, using env only");
    }
    // Environment variable overrides, e.g., EXAMGATE__REDIS__URL=redis://cache:6379
    builder = builder.add_source(
        Environment::with_prefix("EXAMGATE")
            .try_parsing(true)
            .separator("__"),
    );
    let cfg = builder
        .build()
        .map_err(|e| ConfigError::Load(format!("config build error: {e}")))?;
    let merged: AppConfig = cfg
        .try_deserialize()
        .map_err(|e| ConfigError::Load(format!("config deserialize error: {e}")))?;
    merged.validate()?;
    Ok(merged)
}

pub fn load_config_with_default_path<P: AsRef<Path>>(path: Option<P>) -> Result<AppConfig> {
    let p = path
        .as_ref()
        .map(|p| p.as_ref().to_string_lossy().to_string());
    load_config(p.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{IdentitySource, LogFormat};
    use std::fs;

    const CONFIG: &str = r#"
[server]
port = 9090

[logging]
level = "debug"
format = "json"

[redis]
url = "redis://127.0.0.1:6379"
timeout_ms = 250

[cache]
local_ceiling_secs = 120
invalidation_channel = "cache:invalidate"

[cache.ttl]
short = 60

[rate_limit.route_classes.auth]
window_ms = 900000
max = 5
skip_successful_requests = true

[rate_limit.route_classes.submission]
window_ms = 60000
max = 30
identity = { header = "x-attempt-id" }

[rate_limit.route_classes.general]
window_ms = 60000
max = 200
"#;

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("examgate.toml");
        fs::write(&path, CONFIG).expect("write toml");

        let cfg = load_config(path.to_str()).expect("should parse config");
        assert_eq!(cfg.server.port, 9090);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert_eq!(cfg.redis.timeout_ms, 250);
        assert_eq!(cfg.cache.local_ceiling_secs, 120);
        assert_eq!(cfg.cache.ttl.short, 60);
        assert_eq!(cfg.cache.ttl.medium, 1800);
        assert!(!cfg.rate_limit.trust_proxy_headers);
        assert_eq!(
            cfg.cache.invalidation_channel.as_deref(),
            Some("cache:invalidate")
        );

        let auth = cfg.rate_limit.route_class("auth").expect("auth class");
        assert_eq!(auth.max, 5);
        assert!(auth.skip_successful_requests);
        assert_eq!(auth.identity, IdentitySource::Address);

        let submission = cfg.rate_limit.route_class("submission").expect("submission");
        assert_eq!(
            submission.identity,
            IdentitySource::Header("x-attempt-id".into())
        );
    }

    #[test]
    fn test_missing_required_values_fail() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("examgate.toml");
        fs::write(&path, "[server]\nport = 8080\n").expect("write toml");

        let err = load_config(path.to_str()).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }
}
