use ::config::{ConfigError, Environment};
use serde::Deserialize;

/// Process configuration, read from the environment (`.env` is loaded first by `main`)
#[derive(Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// Base64 encoded 32-byte key for token encryption
    pub token_encryption_key: String,
    pub cron_secret: String,
    /// Bearer secret for the connection, review and read endpoints
    pub operator_secret: String,
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    #[serde(default)]
    pub bank_feed_base_url: Option<String>,
    #[serde(default)]
    pub bank_feed_authorize_url: Option<String>,
    #[serde(default)]
    pub bank_feed_token_url: Option<String>,
    #[serde(default)]
    pub bank_feed_client_id: Option<String>,
    #[serde(default)]
    pub bank_feed_client_secret: Option<String>,
    #[serde(default)]
    pub bank_feed_redirect_uri: Option<String>,

    #[serde(default)]
    pub accounting_base_url: Option<String>,
    #[serde(default)]
    pub accounting_authorize_url: Option<String>,
    #[serde(default)]
    pub accounting_token_url: Option<String>,
    #[serde(default)]
    pub accounting_client_id: Option<String>,
    #[serde(default)]
    pub accounting_client_secret: Option<String>,
    #[serde(default)]
    pub accounting_redirect_uri: Option<String>,

    pub http_timeout_secs: u64,
    pub http_max_retries: u32,
    pub job_concurrency: usize,
    pub job_run_day: u32,
    pub job_run_hour: u32,
    pub scheduler_enabled: bool,
}

/// Endpoints and OAuth client credentials for one provider
#[derive(Clone)]
pub struct ProviderSettings {
    pub base_url: String,
    pub authorize_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

fn required(value: &Option<String>, key: &str) -> Result<String, ConfigError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ConfigError::NotFound(key.to_string()))
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Environment::default())
    }

    fn load(environment: Environment) -> Result<Self, ConfigError> {
        let config: Config = ::config::Config::builder()
            .set_default("bind_address", "0.0.0.0:8080")?
            .set_default("http_timeout_secs", 30)?
            .set_default("http_max_retries", 3)?
            .set_default("job_concurrency", 4)?
            .set_default("job_run_day", 1)?
            .set_default("job_run_hour", 2)?
            .set_default("scheduler_enabled", true)?
            .add_source(environment.try_parsing(true))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=31).contains(&self.job_run_day) {
            return Err(ConfigError::Message(format!(
                "JOB_RUN_DAY must be between 1 and 31, got {}",
                self.job_run_day
            )));
        }
        if self.job_run_hour > 23 {
            return Err(ConfigError::Message(format!(
                "JOB_RUN_HOUR must be between 0 and 23, got {}",
                self.job_run_hour
            )));
        }
        if self.job_concurrency == 0 {
            return Err(ConfigError::Message("JOB_CONCURRENCY must be at least 1".to_string()));
        }
        if self.cron_secret.trim().is_empty() {
            return Err(ConfigError::NotFound("CRON_SECRET".to_string()));
        }
        if self.operator_secret.trim().is_empty() {
            return Err(ConfigError::NotFound("OPERATOR_SECRET".to_string()));
        }
        if self.operator_secret.trim() == self.cron_secret.trim() {
            return Err(ConfigError::Message(
                "OPERATOR_SECRET must differ from CRON_SECRET".to_string(),
            ));
        }
        Ok(())
    }

    /// `None` when no bank feed client id is configured
    pub fn bank_feed(&self) -> Result<Option<ProviderSettings>, ConfigError> {
        if self.bank_feed_client_id.as_deref().map_or(true, |id| id.trim().is_empty()) {
            return Ok(None);
        }
        Ok(Some(ProviderSettings {
            base_url: required(&self.bank_feed_base_url, "BANK_FEED_BASE_URL")?,
            authorize_url: required(&self.bank_feed_authorize_url, "BANK_FEED_AUTHORIZE_URL")?,
            token_url: required(&self.bank_feed_token_url, "BANK_FEED_TOKEN_URL")?,
            client_id: required(&self.bank_feed_client_id, "BANK_FEED_CLIENT_ID")?,
            client_secret: required(&self.bank_feed_client_secret, "BANK_FEED_CLIENT_SECRET")?,
            redirect_uri: required(&self.bank_feed_redirect_uri, "BANK_FEED_REDIRECT_URI")?,
        }))
    }

    /// `None` when no accounting client id is configured
    pub fn accounting(&self) -> Result<Option<ProviderSettings>, ConfigError> {
        if self.accounting_client_id.as_deref().map_or(true, |id| id.trim().is_empty()) {
            return Ok(None);
        }
        Ok(Some(ProviderSettings {
            base_url: required(&self.accounting_base_url, "ACCOUNTING_BASE_URL")?,
            authorize_url: required(&self.accounting_authorize_url, "ACCOUNTING_AUTHORIZE_URL")?,
            token_url: required(&self.accounting_token_url, "ACCOUNTING_TOKEN_URL")?,
            client_id: required(&self.accounting_client_id, "ACCOUNTING_CLIENT_ID")?,
            client_secret: required(&self.accounting_client_secret, "ACCOUNTING_CLIENT_SECRET")?,
            redirect_uri: required(&self.accounting_redirect_uri, "ACCOUNTING_REDIRECT_URI")?,
        }))
    }

    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_allowed_origins
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> Environment {
        let base = [
            ("DATABASE_URL", "postgres://localhost/revenue"),
            ("TOKEN_ENCRYPTION_KEY", "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="),
            ("CRON_SECRET", "cron-secret"),
            ("OPERATOR_SECRET", "operator-secret"),
        ];
        let map: HashMap<String, String> = base
            .iter()
            .chain(pairs.iter())
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Environment::default().source(Some(map))
    }

    #[test]
    fn test_defaults_applied() {
        let config = Config::load(env(&[])).unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert_eq!(config.http_timeout_secs, 30);
        assert_eq!(config.http_max_retries, 3);
        assert_eq!(config.job_concurrency, 4);
        assert_eq!(config.job_run_day, 1);
        assert_eq!(config.job_run_hour, 2);
        assert!(config.scheduler_enabled);
        assert!(config.bank_feed().unwrap().is_none());
        assert!(config.accounting().unwrap().is_none());
        assert!(config.cors_origins().is_empty());
    }

    #[test]
    fn test_overrides_and_provider_settings() {
        let config = Config::load(env(&[
            ("JOB_CONCURRENCY", "8"),
            ("SCHEDULER_ENABLED", "false"),
            ("CORS_ALLOWED_ORIGINS", "https://ops.example.com, http://localhost:3000"),
            ("ACCOUNTING_BASE_URL", "https://api.accounting.test"),
            ("ACCOUNTING_AUTHORIZE_URL", "https://login.accounting.test/authorize"),
            ("ACCOUNTING_TOKEN_URL", "https://login.accounting.test/token"),
            ("ACCOUNTING_CLIENT_ID", "client"),
            ("ACCOUNTING_CLIENT_SECRET", "secret"),
            ("ACCOUNTING_REDIRECT_URI", "https://app.test/callback"),
        ]))
        .unwrap();

        assert_eq!(config.job_concurrency, 8);
        assert!(!config.scheduler_enabled);
        assert_eq!(config.cors_origins(), vec!["https://ops.example.com", "http://localhost:3000"]);
        let accounting = config.accounting().unwrap().unwrap();
        assert_eq!(accounting.base_url, "https://api.accounting.test");
    }

    #[test]
    fn test_partial_provider_settings_rejected() {
        let config = Config::load(env(&[("BANK_FEED_CLIENT_ID", "client")])).unwrap();
        assert!(matches!(config.bank_feed(), Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_invalid_schedule_rejected() {
        assert!(Config::load(env(&[("JOB_RUN_DAY", "32")])).is_err());
        assert!(Config::load(env(&[("JOB_RUN_HOUR", "24")])).is_err());
    }

    #[test]
    fn test_operator_secret_required_and_distinct() {
        assert!(Config::load(env(&[("OPERATOR_SECRET", " ")])).is_err());
        assert!(Config::load(env(&[("OPERATOR_SECRET", "cron-secret")])).is_err());
    }

    #[test]
    fn test_missing_required_key() {
        let map: HashMap<String, String> =
            [("DATABASE_URL".to_string(), "postgres://localhost/revenue".to_string())].into();
        assert!(Config::load(Environment::default().source(Some(map))).is_err());
    }
}
