//! Dispenser middleware client.
//!
//! The middleware owns the serial link to the dispensing controller and
//! exposes it as a small stateful HTTP API: open a session, send signed
//! credits, close the session. This module wraps those calls and normalises
//! the middleware's mixed response formats (JSON or a bare `OK`).
//!
//! The client never retries; retry policy belongs to the caller.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::error::{GatewayError, ResolutionError};

/// PLU prefixes stripped before integer conversion (`PLU007` -> 7).
const KNOWN_PLU_PREFIXES: &[&str] = &["PLU", "BASE", "MIX"];

// ---------------------------------------------------------------------------
// Credit target
// ---------------------------------------------------------------------------

/// Direction of a credit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sign {
    /// Issue a credit (enables dispensing).
    #[serde(rename = "+")]
    Plus,
    /// Reverse a previously issued credit.
    #[serde(rename = "-")]
    Minus,
}

impl fmt::Display for Sign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sign::Plus => f.write_str("+"),
            Sign::Minus => f.write_str("-"),
        }
    }
}

/// One resolved unit of dispensing work. Serializes to exactly the
/// `send-credit` request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditTarget {
    server_no: u32,
    plu_no: u32,
    sign: Sign,
    quantity: u32,
}

impl CreditTarget {
    /// Build a target from a catalog PLU code such as `"PLU007"` or `"12"`.
    pub fn new(
        server_no: u32,
        plu_code: &str,
        sign: Sign,
        quantity: u32,
    ) -> Result<Self, ResolutionError> {
        Ok(Self {
            server_no,
            plu_no: parse_plu(plu_code)?,
            sign,
            quantity,
        })
    }

    /// Compensating target: same server, PLU and quantity, opposite sign.
    pub fn reversed(&self) -> Self {
        Self {
            sign: match self.sign {
                Sign::Plus => Sign::Minus,
                Sign::Minus => Sign::Plus,
            },
            ..*self
        }
    }

    pub fn server_no(&self) -> u32 {
        self.server_no
    }

    pub fn plu_no(&self) -> u32 {
        self.plu_no
    }

    pub fn sign(&self) -> Sign {
        self.sign
    }

    pub fn quantity(&self) -> u32 {
        self.quantity
    }
}

impl fmt::Display for CreditTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "server {} PLU {} {}{}",
            self.server_no, self.plu_no, self.sign, self.quantity
        )
    }
}

/// Normalise a PLU code to the positive integer the device expects.
pub fn parse_plu(code: &str) -> Result<u32, ResolutionError> {
    let trimmed = code.trim();
    let digits = KNOWN_PLU_PREFIXES
        .iter()
        .find_map(|p| trimmed.strip_prefix(p))
        .unwrap_or(trimmed);
    match digits.parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ResolutionError::InvalidPlu {
            plu: code.to_string(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Successful middleware acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayAck {
    pub message: String,
    /// Raw response body, kept for the ledger.
    pub payload: String,
}

/// Middleware health as reported by `GET /api/status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayStatus {
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub baudrate: Option<u32>,
}

/// Classify a `send-credit` response. Pure function of status and body.
pub fn classify_send_response(status: u16, body: &str) -> Result<GatewayAck, GatewayError> {
    if status != StatusCode::OK.as_u16() {
        return Err(GatewayError::HttpError {
            status,
            body: body.trim().to_string(),
        });
    }

    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(obj)) => {
            let text = |key: &str| obj.get(key).and_then(Value::as_str).map(str::to_string);
            if obj.get("success").and_then(Value::as_bool) == Some(true) {
                Ok(GatewayAck {
                    message: text("message").unwrap_or_else(|| "credit sent".to_string()),
                    payload: body.to_string(),
                })
            } else {
                Err(GatewayError::DeviceRejected(
                    text("error")
                        .or_else(|| text("message"))
                        .unwrap_or_else(|| "credit refused by middleware".to_string()),
                ))
            }
        }
        Ok(_) => Err(GatewayError::UnexpectedResponse(body.trim().to_string())),
        Err(_) => {
            let text = body.trim();
            if text == "OK" {
                Ok(GatewayAck {
                    message: "credit sent".to_string(),
                    payload: text.to_string(),
                })
            } else {
                Err(GatewayError::UnexpectedResponse(text.to_string()))
            }
        }
    }
}

/// Session calls only look at the status code.
fn classify_session_response(status: u16, body: &str) -> Result<GatewayAck, GatewayError> {
    if status == StatusCode::OK.as_u16() {
        Ok(GatewayAck {
            message: "ok".to_string(),
            payload: body.to_string(),
        })
    } else {
        Err(GatewayError::HttpError {
            status,
            body: body.trim().to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Gateway trait
// ---------------------------------------------------------------------------

/// Device gateway operations. Stateless per call; the session lives in the
/// middleware.
#[async_trait]
pub trait DeviceGateway: Send + Sync {
    /// Open the middleware session (`connect`).
    async fn open_session(&self) -> Result<GatewayAck, GatewayError>;

    /// Send one signed credit.
    async fn send_credit(&self, target: &CreditTarget) -> Result<GatewayAck, GatewayError>;

    /// Close the middleware session (`disconnect`).
    async fn close_session(&self) -> Result<GatewayAck, GatewayError>;

    /// Query middleware and serial-link status.
    async fn status(&self) -> Result<GatewayStatus, GatewayError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// `DeviceGateway` over the middleware's HTTP API.
pub struct HttpGateway {
    client: Client,
    base_url: String,
    token: Option<String>,
    serial_port: String,
    baudrate: u32,
    request_timeout: Duration,
    status_timeout: Duration,
}

impl HttpGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .build()
            .map_err(|e| GatewayError::Transport(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            token: config.token.clone(),
            serial_port: config.serial_port.clone(),
            baudrate: config.baudrate,
            request_timeout: config.request_timeout,
            status_timeout: config.status_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match self.token.as_deref() {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// POST a JSON body, returning status and body text.
    async fn post(&self, path: &str, body: &Value) -> Result<(u16, String), GatewayError> {
        let url = self.url(path);
        let req = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .json(body);
        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| GatewayError::from_reqwest(&url, &e))?;
        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| GatewayError::from_reqwest(&url, &e))?;
        debug!(url = %url, status, body = %text, "middleware response");
        Ok((status, text))
    }
}

#[async_trait]
impl DeviceGateway for HttpGateway {
    async fn open_session(&self) -> Result<GatewayAck, GatewayError> {
        let body = serde_json::json!({
            "port": self.serial_port,
            "baudrate": self.baudrate,
        });
        let (status, text) = self.post("/api/connect", &body).await?;
        info!(status, port = %self.serial_port, "middleware connect");
        classify_session_response(status, &text)
    }

    async fn send_credit(&self, target: &CreditTarget) -> Result<GatewayAck, GatewayError> {
        let body = serde_json::to_value(target)
            .map_err(|e| GatewayError::Transport(format!("encode credit: {e}")))?;
        info!(credit = %target, "sending credit to middleware");
        let (status, text) = self.post("/api/send-credit", &body).await?;
        let result = classify_send_response(status, &text);
        if let Err(ref e) = result {
            warn!(credit = %target, error = %e, "credit not acknowledged");
        }
        result
    }

    async fn close_session(&self) -> Result<GatewayAck, GatewayError> {
        let (status, text) = self.post("/api/disconnect", &serde_json::json!({})).await?;
        info!(status, "middleware disconnect");
        classify_session_response(status, &text)
    }

    async fn status(&self) -> Result<GatewayStatus, GatewayError> {
        let url = self.url("/api/status");
        let req = self.client.get(&url).timeout(self.status_timeout);
        let resp = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| GatewayError::from_reqwest(&url, &e))?;
        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| GatewayError::from_reqwest(&url, &e))?;
        if status != StatusCode::OK.as_u16() {
            return Err(GatewayError::HttpError { status, body: text });
        }
        // A non-JSON 200 still proves the middleware is up; the link state is unknown.
        Ok(serde_json::from_str::<GatewayStatus>(&text).unwrap_or_default())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
