use chrono_tz::Tz;
use serde::Deserialize;
use std::{env, fs, path::PathBuf};

/// Engine settings loaded from `drip.json` (or `DRIP_CONFIG`).
///
/// Every field has a default, so an absent or partial file still yields a
/// runnable configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// IANA name of the business timezone used for windows and send times.
    pub business_timezone: String,
    /// First local hour (inclusive) in which ticks execute.
    pub window_start_hour: u32,
    /// Last local hour (exclusive) in which ticks execute.
    pub window_end_hour: u32,
    /// Local hour at which scheduled steps become due.
    pub send_hour: u32,
    /// An enrollment due for longer than this opens the gate outside the window.
    pub overdue_grace_minutes: i64,
    /// Default and maximum batch size per tick.
    pub batch_limit: usize,
    pub max_batch_limit: usize,
    /// Number of enrollments processed in parallel within one tick.
    pub concurrency: usize,
    /// TTL of the per-step send lock.
    pub lock_ttl_seconds: i64,
    /// A claim older than this is considered abandoned.
    pub claim_timeout_seconds: i64,
    /// Consecutive failed sends of one step before the enrollment is errored.
    pub max_attempts: u32,
    pub default_agent_name: String,
    pub default_campaign_name: String,
    pub default_folder_name: String,
    pub opt_out_suffix: String,
    /// Shared secret expected by the cron trigger. `None` disables the check.
    pub cron_secret: Option<String>,
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Endpoint accepting send requests. Unset means delivery is unavailable.
    pub url: Option<String>,
    pub token: Option<String>,
    pub timeout_seconds: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            business_timezone: "America/New_York".to_string(),
            window_start_hour: 8,
            window_end_hour: 20,
            send_hour: 9,
            overdue_grace_minutes: 60,
            batch_limit: 50,
            max_batch_limit: 500,
            concurrency: 5,
            lock_ttl_seconds: 120,
            claim_timeout_seconds: 600,
            max_attempts: 5,
            default_agent_name: "your agent".to_string(),
            default_campaign_name: "our campaign".to_string(),
            default_folder_name: "your list".to_string(),
            opt_out_suffix: "Reply STOP to opt out.".to_string(),
            cron_secret: None,
            gateway: GatewayConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse the configured business timezone.
    pub fn timezone(&self) -> anyhow::Result<Tz> {
        self.business_timezone
            .parse::<Tz>()
            .map_err(|e| anyhow::anyhow!("Invalid business_timezone `{}`: {}", self.business_timezone, e))
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.timezone()?;

        if self.window_start_hour > 23 || self.window_end_hour > 24 || self.send_hour > 23 {
            return Err(anyhow::anyhow!("Hours must be within 0..=23 (window end within 0..=24)"));
        }
        if self.window_start_hour >= self.window_end_hour {
            return Err(anyhow::anyhow!(
                "window_start_hour ({}) must be before window_end_hour ({})",
                self.window_start_hour,
                self.window_end_hour
            ));
        }
        if self.concurrency == 0 || self.batch_limit == 0 {
            return Err(anyhow::anyhow!("concurrency and batch_limit must be positive"));
        }
        if self.max_attempts == 0 {
            return Err(anyhow::anyhow!("max_attempts must be at least 1"));
        }
        if self.lock_ttl_seconds <= 0 || self.claim_timeout_seconds <= 0 {
            return Err(anyhow::anyhow!(
                "lock_ttl_seconds ({}) and claim_timeout_seconds ({}) must be positive",
                self.lock_ttl_seconds,
                self.claim_timeout_seconds
            ));
        }

        Ok(())
    }

    /// Clamp a caller-supplied batch limit into `1..=max_batch_limit`.
    pub fn effective_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.batch_limit)
            .clamp(1, self.max_batch_limit.max(1))
    }

    pub fn lock_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lock_ttl_seconds)
    }

    pub fn claim_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.claim_timeout_seconds)
    }

    pub fn overdue_grace(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.overdue_grace_minutes)
    }
}

pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(p) = env::var("DRIP_CONFIG") {
        return Some(PathBuf::from(p));
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg).join("drip").join("drip.json");
        if candidate.exists() {
            return Some(candidate);
        }
    }

    let candidate = PathBuf::from("drip.json");
    if candidate.exists() {
        return Some(candidate);
    }

    None
}

fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            if let Ok(val) = env::var(&name) {
                out.push_str(&val);
            } else {
                out.push_str("${");
                out.push_str(&name);
                out.push('}');
            }
        } else {
            out.push(ch);
        }
    }

    out
}

/// Parse a config document, expanding `${VAR}` references first.
pub fn parse_config(raw: &str) -> anyhow::Result<EngineConfig> {
    let expanded = expand_env_vars(raw);
    let cfg: EngineConfig = serde_json::from_str(&expanded)?;
    cfg.validate()?;
    Ok(cfg)
}

/// Load the engine config from disk, falling back to defaults when no file exists.
pub fn load_engine_config() -> anyhow::Result<EngineConfig> {
    let Some(path) = resolve_config_path() else {
        tracing::info!("No drip.json found, using default engine configuration");
        return Ok(EngineConfig::default());
    };

    tracing::info!("Loading engine configuration from {}", path.display());
    let raw = fs::read_to_string(&path)?;
    parse_config(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = EngineConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.timezone().unwrap(), chrono_tz::America::New_York);
    }

    #[test]
    fn test_partial_document_keeps_defaults() {
        let cfg = parse_config(r#"{ "send_hour": 11, "gateway": { "url": "http://localhost:9000/send" } }"#)
            .unwrap();
        assert_eq!(cfg.send_hour, 11);
        assert_eq!(cfg.window_start_hour, 8);
        assert_eq!(cfg.gateway.url.as_deref(), Some("http://localhost:9000/send"));
    }

    #[test]
    fn test_invalid_timezone_rejected() {
        let err = parse_config(r#"{ "business_timezone": "Mars/Olympus" }"#).unwrap_err();
        assert!(err.to_string().contains("Mars/Olympus"));
    }

    #[test]
    fn test_inverted_window_rejected() {
        assert!(parse_config(r#"{ "window_start_hour": 20, "window_end_hour": 8 }"#).is_err());
    }

    #[test]
    fn test_non_positive_durations_rejected() {
        assert!(parse_config(r#"{ "lock_ttl_seconds": 0 }"#).is_err());
        assert!(parse_config(r#"{ "lock_ttl_seconds": -30 }"#).is_err());
        assert!(parse_config(r#"{ "claim_timeout_seconds": 0 }"#).is_err());
        assert!(parse_config(r#"{ "lock_ttl_seconds": 1, "claim_timeout_seconds": 1 }"#).is_ok());
    }

    #[test]
    fn test_unknown_env_var_left_verbatim() {
        let out = expand_env_vars("token=${DRIP_TEST_SURELY_UNSET_VAR}");
        assert_eq!(out, "token=${DRIP_TEST_SURELY_UNSET_VAR}");
    }

    #[test]
    fn test_expands_env_vars_from_file() {
        // PATH is always present in the test environment.
        let path_value = env::var("PATH").unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "cron_secret": "${{PATH}}" }}"#).unwrap();

        let raw = fs::read_to_string(file.path()).unwrap();
        let cfg = parse_config(&raw).unwrap();
        assert_eq!(cfg.cron_secret.as_deref(), Some(path_value.as_str()));
    }

    #[test]
    fn test_effective_limit_clamps() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.effective_limit(None), 50);
        assert_eq!(cfg.effective_limit(Some(0)), 1);
        assert_eq!(cfg.effective_limit(Some(10_000)), 500);
    }
}
