use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentGateway;
use crate::payments::signature::{alipay_sign, alipay_verify, parse_private_key, parse_public_key};
use crate::payments::types::{
    CallbackNotice, ExternalStatus, GatewayName, GatewayOrderRequest, PaymentArtifact,
    RawCallback, SignatureCheck,
};
use crate::payments::utils::{encode_form_urlencoded, parse_form_urlencoded};
use async_trait::async_trait;
use chrono::{FixedOffset, Offset, Utc};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

pub const ALIPAY_GATEWAY_URL: &str = "https://openapi.alipay.com/gateway.do";
const PAGE_PAY_METHOD: &str = "alipay.trade.page.pay";
const PRODUCT_CODE: &str = "FAST_INSTANT_TRADE_PAY";

#[derive(Clone)]
pub struct AlipayConfig {
    pub app_id: String,
    /// Merchant private key, PKCS#1 or PKCS#8, PEM or bare base64.
    pub private_key: String,
    /// Alipay platform public key used to check notifications.
    pub public_key: String,
    pub gateway_url: String,
    pub notify_url: String,
}

impl std::fmt::Debug for AlipayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlipayConfig")
            .field("app_id", &self.app_id)
            .field("private_key", &"<redacted>")
            .field("public_key_set", &!self.public_key.trim().is_empty())
            .field("gateway_url", &self.gateway_url)
            .field("notify_url", &self.notify_url)
            .finish()
    }
}

impl AlipayConfig {
    pub fn from_env(server_address: &str) -> Self {
        Self {
            app_id: std::env::var("ALIPAY_APP_ID").unwrap_or_default(),
            private_key: std::env::var("ALIPAY_PRIVATE_KEY").unwrap_or_default(),
            public_key: std::env::var("ALIPAY_PUBLIC_KEY").unwrap_or_default(),
            gateway_url: std::env::var("ALIPAY_GATEWAY_URL")
                .unwrap_or_else(|_| ALIPAY_GATEWAY_URL.to_string()),
            notify_url: format!(
                "{}/api/payment/callback/alipay",
                server_address.trim_end_matches('/')
            ),
        }
    }

    fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.app_id.trim().is_empty() {
            missing.push("ALIPAY_APP_ID");
        }
        if self.private_key.trim().is_empty() {
            missing.push("ALIPAY_PRIVATE_KEY");
        }
        if self.public_key.trim().is_empty() {
            missing.push("ALIPAY_PUBLIC_KEY");
        }
        missing
    }
}

#[derive(Debug, Serialize)]
struct AlipayBizContent<'a> {
    out_trade_no: &'a str,
    total_amount: &'a str,
    subject: &'a str,
    body: &'a str,
    product_code: &'a str,
}

pub struct AlipayProvider {
    config: AlipayConfig,
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl std::fmt::Debug for AlipayProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlipayProvider")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AlipayProvider {
    /// Fails with `ConfigIncomplete` when a setting is blank and with
    /// `KeyConfigError` when a key does not parse.
    pub fn new(config: AlipayConfig) -> PaymentResult<Self> {
        let missing = config.missing_fields();
        if !missing.is_empty() {
            return Err(PaymentError::config_incomplete("alipay", &missing));
        }
        let private_key = parse_private_key(&config.private_key)?;
        let public_key = parse_public_key(&config.public_key)?;
        Ok(Self {
            config,
            private_key,
            public_key,
        })
    }

    fn beijing_timestamp() -> String {
        let offset = FixedOffset::east_opt(8 * 3600).unwrap_or_else(|| Utc.fix());
        Utc::now()
            .with_timezone(&offset)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string()
    }

    fn request_params(
        &self,
        request: &GatewayOrderRequest,
        timestamp: String,
    ) -> PaymentResult<BTreeMap<String, String>> {
        let biz_content = serde_json::to_string(&AlipayBizContent {
            out_trade_no: &request.order_id,
            total_amount: &request.payable_amount,
            subject: &request.subject,
            body: &request.body,
            product_code: PRODUCT_CODE,
        })
        .map_err(|e| PaymentError::ValidationError {
            message: format!("failed to encode biz_content: {}", e),
            field: Some("biz_content".to_string()),
        })?;

        let mut params = BTreeMap::new();
        params.insert("app_id".to_string(), self.config.app_id.clone());
        params.insert("method".to_string(), PAGE_PAY_METHOD.to_string());
        params.insert("format".to_string(), "JSON".to_string());
        params.insert("charset".to_string(), "utf-8".to_string());
        params.insert("sign_type".to_string(), "RSA2".to_string());
        params.insert("timestamp".to_string(), timestamp);
        params.insert("version".to_string(), "1.0".to_string());
        params.insert("notify_url".to_string(), self.config.notify_url.clone());
        params.insert("biz_content".to_string(), biz_content);
        Ok(params)
    }

    fn map_trade_status(trade_status: &str) -> ExternalStatus {
        match trade_status {
            "TRADE_SUCCESS" | "TRADE_FINISHED" => ExternalStatus::Success,
            "WAIT_BUYER_PAY" => ExternalStatus::InProgress {
                raw_status: trade_status.to_string(),
            },
            "" => ExternalStatus::Failed {
                reason: "missing trade_status".to_string(),
            },
            other => ExternalStatus::Failed {
                reason: format!("trade_status {}", other),
            },
        }
    }

    fn check_signature(&self, fields: &BTreeMap<String, String>) -> SignatureCheck {
        let sign = match fields.get("sign").filter(|s| !s.trim().is_empty()) {
            Some(sign) => sign,
            None => {
                return SignatureCheck::Invalid {
                    reason: "missing sign".to_string(),
                }
            }
        };
        if let Some(app_id) = fields.get("app_id") {
            if app_id != &self.config.app_id {
                return SignatureCheck::Invalid {
                    reason: format!("app_id {} does not match merchant", app_id),
                };
            }
        }
        if alipay_verify(fields, &self.public_key, sign) {
            SignatureCheck::Valid
        } else {
            SignatureCheck::Invalid {
                reason: "RSA2 signature mismatch".to_string(),
            }
        }
    }
}

#[async_trait]
impl PaymentGateway for AlipayProvider {
    async fn create_payment(&self, request: &GatewayOrderRequest) -> PaymentResult<PaymentArtifact> {
        let mut params = self.request_params(request, Self::beijing_timestamp())?;
        let sign = alipay_sign(&params, &self.private_key)?;
        params.insert("sign".to_string(), sign);

        let payment_url = format!(
            "{}?{}",
            self.config.gateway_url,
            encode_form_urlencoded(&params)
        );
        info!(
            order_id = %request.order_id,
            total_amount = %request.payable_amount,
            "alipay page-pay url issued"
        );

        let mut fields = BTreeMap::new();
        fields.insert("payment_url".to_string(), payment_url.clone());
        Ok(PaymentArtifact {
            redirect_target: payment_url,
            fields,
        })
    }

    async fn parse_callback(&self, callback: &RawCallback) -> PaymentResult<CallbackNotice> {
        let source = if callback.body.trim().is_empty() {
            callback.query.as_deref().unwrap_or("")
        } else {
            callback.body.as_str()
        };
        let fields = parse_form_urlencoded(source)?;
        if fields.is_empty() {
            return Err(PaymentError::MalformedCallback {
                message: "alipay notification carries no fields".to_string(),
            });
        }

        let order_id = fields
            .get("out_trade_no")
            .filter(|v| !v.trim().is_empty())
            .cloned()
            .ok_or_else(|| PaymentError::MalformedCallback {
                message: "alipay notification missing out_trade_no".to_string(),
            })?;

        let signature = self.check_signature(&fields);
        if let SignatureCheck::Invalid { reason } = &signature {
            warn!(order_id = %order_id, reason = %reason, "alipay notification failed verification");
        }

        let trade_status = fields.get("trade_status").map(String::as_str).unwrap_or("");
        Ok(CallbackNotice {
            gateway: GatewayName::Alipay,
            order_id,
            external_status: Self::map_trade_status(trade_status),
            signature,
            fields,
        })
    }

    fn name(&self) -> GatewayName {
        GatewayName::Alipay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::signature::{canonical_pairs, canonical_string, rsa_sha256_verify};
    use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};

    struct Keys {
        merchant: RsaPrivateKey,
        platform: RsaPrivateKey,
    }

    fn keys() -> Keys {
        let mut rng = rand::thread_rng();
        Keys {
            merchant: RsaPrivateKey::new(&mut rng, 1024).expect("merchant key"),
            platform: RsaPrivateKey::new(&mut rng, 1024).expect("platform key"),
        }
    }

    fn provider(keys: &Keys) -> AlipayProvider {
        AlipayProvider::new(AlipayConfig {
            app_id: "2021000000000000".to_string(),
            private_key: keys
                .merchant
                .to_pkcs8_pem(LineEnding::LF)
                .expect("pem")
                .to_string(),
            public_key: RsaPublicKey::from(&keys.platform)
                .to_public_key_pem(LineEnding::LF)
                .expect("pem"),
            gateway_url: ALIPAY_GATEWAY_URL.to_string(),
            notify_url: "https://topup.example.com/api/payment/callback/alipay".to_string(),
        })
        .expect("provider init should succeed")
    }

    fn order_request() -> GatewayOrderRequest {
        GatewayOrderRequest {
            order_id: "PAY71700000000001a2b".to_string(),
            quota_amount: 5_000_000,
            payable_amount: "10.00".to_string(),
            payable_minor_units: 1000,
            subject: "Quota top-up".to_string(),
            body: "Top up 5000000 quota".to_string(),
            client_ip: "127.0.0.1".to_string(),
        }
    }

    fn signed_notification(keys: &Keys, trade_status: &str) -> String {
        let mut fields = BTreeMap::new();
        fields.insert("app_id".to_string(), "2021000000000000".to_string());
        fields.insert("out_trade_no".to_string(), "PAY71700000000001a2b".to_string());
        fields.insert("trade_status".to_string(), trade_status.to_string());
        fields.insert("total_amount".to_string(), "10.00".to_string());
        let sign = alipay_sign(&fields, &keys.platform).expect("sign");
        fields.insert("sign".to_string(), sign);
        fields.insert("sign_type".to_string(), "RSA2".to_string());
        encode_form_urlencoded(&fields)
    }

    #[test]
    fn missing_settings_are_config_incomplete() {
        let err = AlipayProvider::new(AlipayConfig {
            app_id: String::new(),
            private_key: String::new(),
            public_key: "x".to_string(),
            gateway_url: ALIPAY_GATEWAY_URL.to_string(),
            notify_url: String::new(),
        })
        .expect_err("blank settings must fail");
        match err {
            PaymentError::ConfigIncomplete { missing, .. } => {
                assert_eq!(missing, vec!["ALIPAY_APP_ID", "ALIPAY_PRIVATE_KEY"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unparseable_private_key_is_key_config_error() {
        let err = AlipayProvider::new(AlipayConfig {
            app_id: "app".to_string(),
            private_key: "definitely-not-a-key".to_string(),
            public_key: "also-not".to_string(),
            gateway_url: ALIPAY_GATEWAY_URL.to_string(),
            notify_url: String::new(),
        })
        .expect_err("bad key must fail");
        assert!(matches!(err, PaymentError::KeyConfigError { .. }));
    }

    #[tokio::test]
    async fn page_pay_url_carries_verifiable_signature() {
        let keys = keys();
        let provider = provider(&keys);
        let artifact = provider
            .create_payment(&order_request())
            .await
            .expect("url should be built");

        assert!(artifact.redirect_target.starts_with(ALIPAY_GATEWAY_URL));
        assert_eq!(artifact.fields["payment_url"], artifact.redirect_target);

        let query = artifact
            .redirect_target
            .split_once('?')
            .map(|(_, q)| q)
            .expect("url has query");
        let params = parse_form_urlencoded(query).expect("query parses");
        assert_eq!(params["method"], "alipay.trade.page.pay");
        assert_eq!(params["sign_type"], "RSA2");
        assert!(params["biz_content"].contains("\"total_amount\":\"10.00\""));
        assert!(params["biz_content"].contains("FAST_INSTANT_TRADE_PAY"));

        // Request signatures cover sign_type; only `sign` is excluded.
        let merchant_public = RsaPublicKey::from(&keys.merchant);
        let pairs = canonical_pairs(&params, &["sign"]);
        let content = canonical_string(&pairs);
        assert!(rsa_sha256_verify(
            &merchant_public,
            &content,
            &params["sign"]
        ));
    }

    #[tokio::test]
    async fn signed_success_notification_is_valid() {
        let keys = keys();
        let provider = provider(&keys);
        let notice = provider
            .parse_callback(&RawCallback::from_body(signed_notification(&keys, "TRADE_SUCCESS")))
            .await
            .expect("callback should parse");
        assert_eq!(notice.order_id, "PAY71700000000001a2b");
        assert_eq!(notice.external_status, ExternalStatus::Success);
        assert_eq!(notice.signature, SignatureCheck::Valid);
    }

    #[tokio::test]
    async fn notification_falls_back_to_query_string() {
        let keys = keys();
        let provider = provider(&keys);
        let notice = provider
            .parse_callback(&RawCallback {
                body: String::new(),
                query: Some(signed_notification(&keys, "TRADE_CLOSED")),
            })
            .await
            .expect("callback should parse");
        assert!(matches!(notice.external_status, ExternalStatus::Failed { .. }));
        assert!(notice.signature.is_valid());
    }

    #[tokio::test]
    async fn tampered_notification_is_invalid_but_parsed() {
        let keys = keys();
        let provider = provider(&keys);
        let body = signed_notification(&keys, "TRADE_SUCCESS").replace("10.00", "0.01");
        let notice = provider
            .parse_callback(&RawCallback::from_body(body))
            .await
            .expect("callback should parse");
        assert!(matches!(notice.signature, SignatureCheck::Invalid { .. }));
    }

    #[tokio::test]
    async fn notification_without_order_id_is_malformed() {
        let keys = keys();
        let provider = provider(&keys);
        let err = provider
            .parse_callback(&RawCallback::from_body("trade_status=TRADE_SUCCESS"))
            .await
            .expect_err("must fail");
        assert!(matches!(err, PaymentError::MalformedCallback { .. }));
    }

    #[test]
    fn wait_buyer_pay_is_in_progress() {
        assert!(matches!(
            AlipayProvider::map_trade_status("WAIT_BUYER_PAY"),
            ExternalStatus::InProgress { .. }
        ));
        assert!(AlipayProvider::map_trade_status("TRADE_FINISHED").is_success());
    }
}
