//! Dispenser gateway configuration.
//!
//! Settings live in the `local_settings` table under the `dispenser`
//! category. Missing keys fall back to defaults; malformed values are an
//! error rather than being silently replaced.

use rusqlite::Connection;
use std::time::Duration;
use tracing::info;

use crate::db;
use crate::error::ConfigError;

pub const SETTINGS_CATEGORY: &str = "dispenser";

const KEY_URL: &str = "middleware_url";
const KEY_TOKEN: &str = "middleware_token";
const KEY_SERVER_NO: &str = "server_no";
const KEY_SERIAL_PORT: &str = "serial_port";
const KEY_BAUDRATE: &str = "baudrate";
const KEY_TIMEOUT_SECS: &str = "timeout_secs";
const KEY_STATUS_TIMEOUT_SECS: &str = "status_timeout_secs";
const KEY_ALLOW_PLACEHOLDERS: &str = "allow_placeholder_ingredients";

const DEFAULT_URL: &str = "http://127.0.0.1:5000";
const DEFAULT_SERIAL_PORT: &str = "COM1";
const DEFAULT_BAUDRATE: u32 = 9600;
const DEFAULT_SERVER_NO: u32 = 1;

/// Per-call timeout for connect / send-credit / disconnect.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the lightweight status probe.
const DEFAULT_STATUS_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection settings for the dispenser middleware.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub base_url: String,
    /// Sent as a bearer token when non-empty.
    pub token: Option<String>,
    /// Device identity of this installation. Credits always carry the
    /// acting barman's own server number; this is informational.
    pub server_no: u32,
    pub serial_port: String,
    pub baudrate: u32,
    pub request_timeout: Duration,
    pub status_timeout: Duration,
    /// Enables the degraded placeholder-ingredient fallback for cocktails.
    pub allow_placeholder_ingredients: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_URL.to_string(),
            token: None,
            server_no: DEFAULT_SERVER_NO,
            serial_port: DEFAULT_SERIAL_PORT.to_string(),
            baudrate: DEFAULT_BAUDRATE,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            status_timeout: DEFAULT_STATUS_TIMEOUT,
            allow_placeholder_ingredients: false,
        }
    }
}

impl GatewayConfig {
    /// Build a config for `base_url` with every other field defaulted.
    pub fn with_url(base_url: &str) -> Result<Self, ConfigError> {
        let base_url = normalize_middleware_url(base_url);
        if base_url.is_empty() {
            return Err(ConfigError::EmptyUrl);
        }
        Ok(Self {
            base_url,
            ..Self::default()
        })
    }

    /// Load the config from `local_settings`, falling back to defaults.
    pub fn load(conn: &Connection) -> Result<Self, ConfigError> {
        let get = |key| db::get_setting(conn, SETTINGS_CATEGORY, key);

        let mut config = match get(KEY_URL) {
            Some(url) => Self::with_url(&url)?,
            None => Self::default(),
        };

        config.token = get(KEY_TOKEN)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        if let Some(v) = get(KEY_SERVER_NO) {
            config.server_no = parse_positive(KEY_SERVER_NO, &v)?;
        }
        if let Some(v) = get(KEY_SERIAL_PORT) {
            let port = v.trim();
            if port.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: KEY_SERIAL_PORT,
                    value: v,
                });
            }
            config.serial_port = port.to_string();
        }
        if let Some(v) = get(KEY_BAUDRATE) {
            config.baudrate = parse_positive(KEY_BAUDRATE, &v)?;
        }
        if let Some(v) = get(KEY_TIMEOUT_SECS) {
            config.request_timeout =
                Duration::from_secs(parse_positive(KEY_TIMEOUT_SECS, &v)?.into());
        }
        if let Some(v) = get(KEY_STATUS_TIMEOUT_SECS) {
            config.status_timeout =
                Duration::from_secs(parse_positive(KEY_STATUS_TIMEOUT_SECS, &v)?.into());
        }
        if let Some(v) = get(KEY_ALLOW_PLACEHOLDERS) {
            config.allow_placeholder_ingredients = parse_bool(KEY_ALLOW_PLACEHOLDERS, &v)?;
        }

        info!(
            url = %config.base_url,
            server_no = config.server_no,
            token_configured = config.token.is_some(),
            "dispenser gateway config loaded"
        );
        Ok(config)
    }

    /// Persist the config into `local_settings`.
    pub fn save(&self, conn: &Connection) -> Result<(), ConfigError> {
        let set = |key, value: &str| db::set_setting(conn, SETTINGS_CATEGORY, key, value);
        set(KEY_URL, &self.base_url)?;
        set(KEY_TOKEN, self.token.as_deref().unwrap_or(""))?;
        set(KEY_SERVER_NO, &self.server_no.to_string())?;
        set(KEY_SERIAL_PORT, &self.serial_port)?;
        set(KEY_BAUDRATE, &self.baudrate.to_string())?;
        set(KEY_TIMEOUT_SECS, &self.request_timeout.as_secs().to_string())?;
        set(
            KEY_STATUS_TIMEOUT_SECS,
            &self.status_timeout.as_secs().to_string(),
        )?;
        set(
            KEY_ALLOW_PLACEHOLDERS,
            if self.allow_placeholder_ingredients {
                "true"
            } else {
                "false"
            },
        )?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the middleware URL:
/// - ensure a scheme is present (plain http, the middleware runs on the LAN)
/// - strip trailing slashes
/// - strip a trailing `/api` segment
pub fn normalize_middleware_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        url = format!("http://{url}");
    }

    while url.ends_with('/') {
        url.pop();
    }

    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

fn parse_positive(key: &'static str, raw: &str) -> Result<u32, ConfigError> {
    match raw.trim().parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: raw.to_string(),
        }),
    }
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: raw.to_string(),
        }),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
