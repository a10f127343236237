//! Error taxonomy for the dispenser credit gateway.
//!
//! Authorization and precondition failures abort an entry point before any
//! side effect. Gateway failures are captured per item and surface inside
//! structured results; they only appear as `Err` from the gateway client
//! itself.

use thiserror::Error;

/// Authorization guard failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("access denied: user {user} does not hold the Barman role")]
    Forbidden { user: String },

    #[error("no dispenser server number assigned to user {user}")]
    MissingServerAssignment { user: String },
}

/// Catalog/configuration defects found while resolving credit targets.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("product \"{product}\" has no PLU code configured")]
    MissingPlu { product: String },

    #[error("invalid PLU code {plu:?}")]
    InvalidPlu { plu: String },

    #[error("no ingredients resolved for cocktail \"{product}\"")]
    NoIngredientsResolved { product: String },
}

/// Transport and device failures reported by the gateway client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("cannot reach dispenser middleware at {url}")]
    ConnectionRefused { url: String },

    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    #[error("device rejected credit: {0}")]
    DeviceRejected(String),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("network error: {0}")]
    Transport(String),
}

impl GatewayError {
    pub(crate) fn from_reqwest(url: &str, err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout {
                url: url.to_string(),
            };
        }
        if err.is_connect() {
            return Self::ConnectionRefused {
                url: url.to_string(),
            };
        }
        Self::Transport(err.to_string())
    }
}

/// Credit ledger failures.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("credit {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: String,
        to: &'static str,
    },

    #[error("credit log entry {0} not found")]
    NotFound(i64),

    #[error("ledger storage: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("ledger lock poisoned")]
    Poisoned,
}

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("dispenser middleware URL is empty")]
    EmptyUrl,

    #[error("invalid value {value:?} for setting {key}")]
    InvalidValue { key: &'static str, value: String },

    #[error("settings storage: {0}")]
    Storage(#[from] rusqlite::Error),
}

/// Errors returned by the order-management entry points.
#[derive(Debug, Error)]
pub enum DispenseError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("product {0} not found")]
    ProductNotFound(i64),

    #[error("order line {0} not found")]
    LineNotFound(String),

    #[error("product \"{0}\" is not a dispenser drink")]
    NotDispenserProduct(String),

    #[error("product \"{0}\" is not a cocktail")]
    NotCocktail(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
