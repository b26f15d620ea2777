//! HTTP client for the key-exchange relay.
//!
//! The relay takes the pump's challenge and public key, obtains an
//! attestation token on its own, calls the upstream key-encryption
//! service, and returns the blob this app writes back to the pump. All
//! byte fields travel as lowercase hex strings.

use std::time::Duration;

use data_encoding::HEXLOWER;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Connect and read bounds for the relay call; the upstream attestation
/// round-trip can be slow.
const RELAY_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay transport: {0}")]
    Transport(String),
    #[error("relay returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("relay response malformed: {0}")]
    MalformedResponse(&'static str),
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        RelayError::Transport(err.to_string())
    }
}

/// Inputs to one key-exchange call.
pub struct KeyExchangeRequest {
    pub challenge: [u8; 32],
    pub pump_public_key: [u8; 32],
    pub app_public_key: [u8; 32],
    pub bt_address: [u8; 6],
    pub device_id: String,
    /// Opaque attestation token, passed through uninspected when the
    /// host supplies one.
    pub integrity_token: Option<String>,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    challenge: String,
    pump_public_key: String,
    app_public_key: String,
    bt_address: String,
    device_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    integrity_token: Option<&'a str>,
}

#[derive(Deserialize)]
struct WireResponse {
    encrypted_bytes: String,
    #[serde(default)]
    server_nonce: String,
}

/// Successful relay reply.
pub struct KeyExchangeReply {
    /// Blob to write to the pump's key-write characteristic.
    pub encrypted_bytes: Vec<u8>,
    /// Opaque; kept for logging only.
    pub server_nonce: Vec<u8>,
}

pub struct RelayClient {
    base_url: String,
    http: reqwest::Client,
}

impl RelayClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, RelayError> {
        let http = reqwest::Client::builder()
            .connect_timeout(RELAY_TIMEOUT)
            .read_timeout(RELAY_TIMEOUT)
            .build()?;
        Ok(Self { base_url: base_url.into(), http })
    }

    /// `POST {base}/key-exchange`. Any non-200 fails with the body kept
    /// for the logs.
    pub async fn key_exchange(
        &self,
        request: &KeyExchangeRequest,
    ) -> Result<KeyExchangeReply, RelayError> {
        let url = format!("{}/key-exchange", self.base_url.trim_end_matches('/'));
        let body = WireRequest {
            challenge: HEXLOWER.encode(&request.challenge),
            pump_public_key: HEXLOWER.encode(&request.pump_public_key),
            app_public_key: HEXLOWER.encode(&request.app_public_key),
            bt_address: HEXLOWER.encode(&request.bt_address),
            device_id: &request.device_id,
            integrity_token: request.integrity_token.as_deref(),
        };

        debug!(%url, "calling key-exchange relay");
        let response = self.http.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), %body, "relay rejected key exchange");
            return Err(RelayError::Status { status: status.as_u16(), body });
        }

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|_| RelayError::MalformedResponse("body is not the expected json"))?;
        let encrypted_bytes = HEXLOWER
            .decode(wire.encrypted_bytes.as_bytes())
            .map_err(|_| RelayError::MalformedResponse("encrypted_bytes is not hex"))?;
        if encrypted_bytes.is_empty() {
            return Err(RelayError::MalformedResponse("encrypted_bytes is empty"));
        }
        let server_nonce = HEXLOWER
            .decode(wire.server_nonce.as_bytes())
            .unwrap_or_default();

        Ok(KeyExchangeReply { encrypted_bytes, server_nonce })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_request_serializes_lowercase_hex() {
        let request = KeyExchangeRequest {
            challenge: [0xAB; 32],
            pump_public_key: [0xCD; 32],
            app_public_key: [0x12; 32],
            bt_address: [0xEC, 0x2A, 0xF0, 0x02, 0xAF, 0x6F],
            device_id: "device-1".into(),
            integrity_token: None,
        };
        let body = WireRequest {
            challenge: HEXLOWER.encode(&request.challenge),
            pump_public_key: HEXLOWER.encode(&request.pump_public_key),
            app_public_key: HEXLOWER.encode(&request.app_public_key),
            bt_address: HEXLOWER.encode(&request.bt_address),
            device_id: &request.device_id,
            integrity_token: request.integrity_token.as_deref(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["bt_address"], "ec2af002af6f");
        assert_eq!(json["challenge"].as_str().unwrap().len(), 64);
        assert!(json.get("integrity_token").is_none());
    }

    #[test]
    fn wire_response_parses() {
        let wire: WireResponse =
            serde_json::from_str(r#"{"encrypted_bytes":"00ff10","server_nonce":"aa"}"#).unwrap();
        assert_eq!(wire.encrypted_bytes, "00ff10");
        assert_eq!(wire.server_nonce, "aa");

        let without_nonce: WireResponse =
            serde_json::from_str(r#"{"encrypted_bytes":"00"}"#).unwrap();
        assert_eq!(without_nonce.server_nonce, "");
    }
}
