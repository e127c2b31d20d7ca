//! Runtime configuration, loaded from environment variables with typed
//! defaults matching the literal constants in the design (90s watchdog,
//! 30s call timeout, 10s boot `GetConfiguration`, `DEMO_IDTAG` fallback).

use std::time::Duration;

/// Server + engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub ws_host: String,
    pub ws_port: u16,
    pub http_host: String,
    pub http_port: u16,
    pub api_key: Option<String>,
    pub default_id_tag: String,
    pub watchdog_duration: Duration,
    pub call_timeout: Duration,
    pub boot_config_timeout: Duration,
    pub boot_qr_url: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            ws_host: env_or("OCPP_HOST", "0.0.0.0"),
            ws_port: env_parse_or("OCPP_PORT", 9000),
            http_host: env_or("HTTP_HOST", "0.0.0.0"),
            http_port: env_parse_or("HTTP_PORT", 8080),
            api_key: std::env::var("OCPP_API_KEY").ok(),
            default_id_tag: env_or("OCPP_DEFAULT_ID_TAG", "DEMO_IDTAG"),
            watchdog_duration: Duration::from_secs(env_parse_or("OCPP_WATCHDOG_SECS", 90)),
            call_timeout: Duration::from_secs(env_parse_or("OCPP_CALL_TIMEOUT_SECS", 30)),
            boot_config_timeout: Duration::from_secs(env_parse_or("OCPP_BOOT_TIMEOUT_SECS", 10)),
            boot_qr_url: env_or(
                "OCPP_QR_URL",
                "https://your-domain.example/qr?order_id=TEST123",
            ),
        }
    }

    pub fn ws_address(&self) -> String {
        format!("{}:{}", self.ws_host, self.ws_port)
    }

    pub fn http_address(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ws_host: "0.0.0.0".to_string(),
            ws_port: 9000,
            http_host: "0.0.0.0".to_string(),
            http_port: 8080,
            api_key: None,
            default_id_tag: "DEMO_IDTAG".to_string(),
            watchdog_duration: Duration::from_secs(90),
            call_timeout: Duration::from_secs(30),
            boot_config_timeout: Duration::from_secs(10),
            boot_qr_url: "https://your-domain.example/qr?order_id=TEST123".to_string(),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
