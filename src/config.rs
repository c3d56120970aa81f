use serde::Deserialize;
use std::time::Duration;
use url::Url;

use crate::error::DispatchError;

pub const DEFAULT_QUEUE_CAPACITY: usize = 5;
pub const DEFAULT_RETRY_BUDGET: u32 = 1;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_ECHO_RETRY_DELAY_MS: u64 = 100;
pub const MAX_QUEUE_CAPACITY: usize = 1_000;

const DEVICE_ROUTE: &str = "device/";

#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatcherConfig {
    /// Backend root; always ends with `/` once validated.
    pub base_url: String,
    /// Identity used for the echo endpoint.
    pub device_id: String,
    pub queue_capacity: usize,
    /// Automatic immediate retries per envelope while online.
    pub retry_budget: u32,
    pub request_timeout_ms: u64,
    pub echo_retry_delay_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            base_url: "https://localhost/".to_string(),
            device_id: String::new(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            retry_budget: DEFAULT_RETRY_BUDGET,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            echo_retry_delay_ms: DEFAULT_ECHO_RETRY_DELAY_MS,
        }
    }
}

impl DispatcherConfig {
    pub fn new(base_url: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            base_url: normalize_base_url(base_url.into()),
            device_id: device_id.into(),
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self, DispatchError> {
        let mut config: Self = serde_json::from_str(json)?;
        config.base_url = normalize_base_url(config.base_url);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        let parsed = Url::parse(&self.base_url).map_err(|e| DispatchError::InvalidUrl {
            url: self.base_url.clone(),
            reason: e.to_string(),
        })?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(DispatchError::InvalidUrl {
                url: self.base_url.clone(),
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }
        if self.device_id.trim().is_empty() {
            return Err(DispatchError::InvalidConfig(
                "device_id must not be empty".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(DispatchError::InvalidConfig(
                "queue_capacity must be > 0".into(),
            ));
        }
        if self.queue_capacity > MAX_QUEUE_CAPACITY {
            return Err(DispatchError::InvalidConfig(format!(
                "queue_capacity must be <= {MAX_QUEUE_CAPACITY}"
            )));
        }
        if self.request_timeout_ms == 0 {
            return Err(DispatchError::InvalidConfig(
                "request_timeout_ms must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn echo_url(&self) -> String {
        format!("{}{}{}", self.base_url, DEVICE_ROUTE, self.device_id)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn echo_retry_delay(&self) -> Duration {
        Duration::from_millis(self.echo_retry_delay_ms)
    }
}

pub(crate) fn normalize_base_url(mut base_url: String) -> String {
    if !base_url.ends_with('/') {
        base_url.push('/');
    }
    base_url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_observed_client() {
        let config = DispatcherConfig::default();
        assert_eq!(config.queue_capacity, 5);
        assert_eq!(config.retry_budget, 1);
        assert_eq!(config.echo_retry_delay(), Duration::from_millis(100));
    }

    #[test]
    fn base_url_gains_trailing_slash() {
        let config = DispatcherConfig::new("https://cj101d.ifdnrg.com/api", "test-uuid");
        assert_eq!(config.base_url, "https://cj101d.ifdnrg.com/api/");
        assert_eq!(
            config.echo_url(),
            "https://cj101d.ifdnrg.com/api/device/test-uuid"
        );
    }

    #[test]
    fn validation_rejects_bad_values() {
        let good = DispatcherConfig::new("https://example.com", "dev-1");
        assert!(good.validate().is_ok());

        let no_device = DispatcherConfig::new("https://example.com", "  ");
        assert!(no_device.validate().is_err());

        let zero_capacity = DispatcherConfig {
            queue_capacity: 0,
            ..good.clone()
        };
        assert!(zero_capacity.validate().is_err());

        let zero_timeout = DispatcherConfig {
            request_timeout_ms: 0,
            ..good.clone()
        };
        assert!(zero_timeout.validate().is_err());

        let bad_scheme = DispatcherConfig::new("ftp://example.com", "dev-1");
        assert!(matches!(
            bad_scheme.validate(),
            Err(DispatchError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn zero_retry_budget_is_allowed() {
        let config = DispatcherConfig {
            retry_budget: 0,
            ..DispatcherConfig::new("https://example.com", "dev-1")
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn loads_from_json_with_defaults() {
        let config = DispatcherConfig::from_json(
            r#"{"base_url":"https://example.com/api","device_id":"abc","queue_capacity":8}"#,
        )
        .unwrap();
        assert_eq!(config.base_url, "https://example.com/api/");
        assert_eq!(config.queue_capacity, 8);
        assert_eq!(config.retry_budget, 1);

        assert!(DispatcherConfig::from_json(r#"{"device_id":"abc","bogus":1}"#).is_err());
    }
}
