use crate::payments::error::{PaymentError, PaymentResult};
use reqwest::Client;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

/// Thin HTTP client for gateway calls. Every request is bounded by `timeout`;
/// a timed-out call is reported as a retryable `NetworkError`.
#[derive(Clone)]
pub struct PaymentHttpClient {
    client: Client,
    timeout: Duration,
}

impl PaymentHttpClient {
    pub fn new(timeout: Duration) -> PaymentResult<Self> {
        let client =
            Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| PaymentError::NetworkError {
                    message: format!("failed to initialize HTTP client: {}", e),
                })?;

        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// POSTs a raw body and returns the response text of a 2xx reply.
    pub async fn post_text(
        &self,
        gateway: &str,
        url: &str,
        content_type: &str,
        body: String,
    ) -> PaymentResult<String> {
        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .header("Content-Type", content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PaymentError::NetworkError {
                        message: format!("{} request timed out after {:?}", gateway, self.timeout),
                    }
                } else {
                    PaymentError::NetworkError {
                        message: format!("{} request failed: {}", gateway, e),
                    }
                }
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| PaymentError::NetworkError {
            message: format!("{} response body unreadable: {}", gateway, e),
        })?;

        if !status.is_success() {
            warn!(gateway = gateway, status = %status, "gateway returned non-success status");
            return Err(PaymentError::GatewayCallFailed {
                gateway: gateway.to_string(),
                message: format!("HTTP {}: {}", status, text),
                gateway_code: Some(status.as_u16().to_string()),
                retryable: status.is_server_error(),
            });
        }

        Ok(text)
    }
}

pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0_u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Decodes an `application/x-www-form-urlencoded` body. Later duplicates of a
/// name are ignored.
pub fn parse_form_urlencoded(body: &str) -> PaymentResult<BTreeMap<String, String>> {
    let mut fields = BTreeMap::new();
    for pair in body.trim().split('&').filter(|p| !p.is_empty()) {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        let name = decode_form_component(name)?;
        let value = decode_form_component(value)?;
        fields.entry(name).or_insert(value);
    }
    Ok(fields)
}

fn decode_form_component(raw: &str) -> PaymentResult<String> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|decoded| decoded.into_owned())
        .map_err(|e| PaymentError::MalformedCallback {
            message: format!("invalid form encoding: {}", e),
        })
}

/// Encodes fields as a query string in name order.
pub fn encode_form_urlencoded(fields: &BTreeMap<String, String>) -> String {
    fields
        .iter()
        .map(|(name, value)| {
            format!(
                "{}={}",
                urlencoding::encode(name),
                urlencoding::encode(value)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}
