use crate::payments::error::PaymentError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GatewayName {
    Alipay,
    Wechat,
    Paypal,
}

impl GatewayName {
    pub const ALL: [GatewayName; 3] = [GatewayName::Alipay, GatewayName::Wechat, GatewayName::Paypal];

    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayName::Alipay => "alipay",
            GatewayName::Wechat => "wechat",
            GatewayName::Paypal => "paypal",
        }
    }
}

impl std::fmt::Display for GatewayName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for GatewayName {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "alipay" => Ok(GatewayName::Alipay),
            "wechat" | "wxpay" | "wechatpay" => Ok(GatewayName::Wechat),
            "paypal" => Ok(GatewayName::Paypal),
            _ => Err(PaymentError::UnsupportedGateway(value.to_string())),
        }
    }
}

/// Everything a gateway needs to issue a payable artifact for one order.
#[derive(Debug, Clone)]
pub struct GatewayOrderRequest {
    pub order_id: String,
    pub quota_amount: i64,
    /// Currency amount with two decimals, e.g. `"10.00"`.
    pub payable_amount: String,
    /// Same amount in minor units (cents / fen).
    pub payable_minor_units: i64,
    pub subject: String,
    pub body: String,
    pub client_ip: String,
}

/// Normalized result of asking a gateway for something the user can pay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentArtifact {
    /// Redirect URL or QR payload.
    pub redirect_target: String,
    pub fields: BTreeMap<String, String>,
}

/// Outcome reported by the gateway for a payment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExternalStatus {
    Success,
    Failed { reason: String },
    /// Intermediate notification (e.g. waiting for the buyer); nothing to apply yet.
    InProgress { raw_status: String },
}

impl ExternalStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ExternalStatus::Success)
    }
}

/// Result of authenticating an inbound callback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SignatureCheck {
    Valid,
    Invalid { reason: String },
    /// No local scheme and no positive confirmation from the provider.
    Unverified { reason: String },
}

impl SignatureCheck {
    pub fn is_valid(&self) -> bool {
        matches!(self, SignatureCheck::Valid)
    }
}

/// Raw inbound callback as handed over by the HTTP layer.
#[derive(Debug, Clone, Default)]
pub struct RawCallback {
    pub body: String,
    pub query: Option<String>,
}

impl RawCallback {
    pub fn from_body(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            query: None,
        }
    }
}

/// Parsed and authenticated callback, ready for the order state machine.
#[derive(Debug, Clone)]
pub struct CallbackNotice {
    pub gateway: GatewayName,
    pub order_id: String,
    pub external_status: ExternalStatus,
    pub signature: SignatureCheck,
    pub fields: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_name_parses_path_segments() {
        assert_eq!(GatewayName::from_str("alipay").unwrap(), GatewayName::Alipay);
        assert_eq!(GatewayName::from_str(" WeChat ").unwrap(), GatewayName::Wechat);
        assert_eq!(GatewayName::from_str("paypal").unwrap(), GatewayName::Paypal);
        assert!(matches!(
            GatewayName::from_str("stripe"),
            Err(PaymentError::UnsupportedGateway(_))
        ));
    }

    #[test]
    fn gateway_name_serializes_snake_case() {
        let json = serde_json::to_value(GatewayName::Wechat).expect("serialization should succeed");
        assert_eq!(json, "wechat");
    }

    #[test]
    fn payment_artifact_serializes_to_json() {
        let mut fields = BTreeMap::new();
        fields.insert("code_url".to_string(), "weixin://wxpay/bizpayurl?pr=abc".to_string());
        let artifact = PaymentArtifact {
            redirect_target: "weixin://wxpay/bizpayurl?pr=abc".to_string(),
            fields,
        };
        let json = serde_json::to_value(&artifact).expect("serialization should succeed");
        assert_eq!(json["fields"]["code_url"], "weixin://wxpay/bizpayurl?pr=abc");
    }
}
