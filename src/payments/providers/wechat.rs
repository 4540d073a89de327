use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentGateway;
use crate::payments::signature::{wechat_md5_sign, wechat_md5_verify};
use crate::payments::types::{
    CallbackNotice, ExternalStatus, GatewayName, GatewayOrderRequest, PaymentArtifact,
    RawCallback, SignatureCheck,
};
use crate::payments::utils::PaymentHttpClient;
use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use rand::Rng;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

pub const WECHAT_UNIFIED_ORDER_URL: &str = "https://api.mch.weixin.qq.com/pay/unifiedorder";
const TRADE_TYPE_NATIVE: &str = "NATIVE";
const SUCCESS: &str = "SUCCESS";
const NONCE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Clone)]
pub struct WechatConfig {
    pub app_id: String,
    pub mch_id: String,
    /// Merchant API key used for MD5 signing.
    pub api_key: String,
    pub unified_order_url: String,
    pub notify_url: String,
    pub timeout_secs: u64,
}

impl std::fmt::Debug for WechatConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WechatConfig")
            .field("app_id", &self.app_id)
            .field("mch_id", &self.mch_id)
            .field("api_key", &"<redacted>")
            .field("unified_order_url", &self.unified_order_url)
            .field("notify_url", &self.notify_url)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl WechatConfig {
    pub fn from_env(server_address: &str, timeout_secs: u64) -> Self {
        Self {
            app_id: std::env::var("WECHAT_APP_ID").unwrap_or_default(),
            mch_id: std::env::var("WECHAT_MCH_ID").unwrap_or_default(),
            api_key: std::env::var("WECHAT_KEY").unwrap_or_default(),
            unified_order_url: std::env::var("WECHAT_UNIFIED_ORDER_URL")
                .unwrap_or_else(|_| WECHAT_UNIFIED_ORDER_URL.to_string()),
            notify_url: format!(
                "{}/api/payment/callback/wechat",
                server_address.trim_end_matches('/')
            ),
            timeout_secs,
        }
    }

    fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.app_id.trim().is_empty() {
            missing.push("WECHAT_APP_ID");
        }
        if self.mch_id.trim().is_empty() {
            missing.push("WECHAT_MCH_ID");
        }
        if self.api_key.trim().is_empty() {
            missing.push("WECHAT_KEY");
        }
        missing
    }
}

pub struct WechatProvider {
    config: WechatConfig,
    http_client: PaymentHttpClient,
}

impl WechatProvider {
    pub fn new(config: WechatConfig) -> PaymentResult<Self> {
        let missing = config.missing_fields();
        if !missing.is_empty() {
            return Err(PaymentError::config_incomplete("wechat", &missing));
        }
        let http_client = PaymentHttpClient::new(Duration::from_secs(config.timeout_secs))?;
        Ok(Self {
            config,
            http_client,
        })
    }

    fn nonce_str() -> String {
        let mut rng = rand::thread_rng();
        (0..32)
            .map(|_| NONCE_CHARSET[rng.gen_range(0..NONCE_CHARSET.len())] as char)
            .collect()
    }

    fn unified_order_params(&self, request: &GatewayOrderRequest) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("appid".to_string(), self.config.app_id.clone());
        params.insert("mch_id".to_string(), self.config.mch_id.clone());
        params.insert("nonce_str".to_string(), Self::nonce_str());
        params.insert("body".to_string(), request.subject.clone());
        params.insert("out_trade_no".to_string(), request.order_id.clone());
        params.insert(
            "total_fee".to_string(),
            request.payable_minor_units.to_string(),
        );
        params.insert("spbill_create_ip".to_string(), request.client_ip.clone());
        params.insert("notify_url".to_string(), self.config.notify_url.clone());
        params.insert("trade_type".to_string(), TRADE_TYPE_NATIVE.to_string());
        let sign = wechat_md5_sign(&params, &self.config.api_key);
        params.insert("sign".to_string(), sign);
        params
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
        if let Some(mch_id) = fields.get("mch_id") {
            if mch_id != &self.config.mch_id {
                return SignatureCheck::Invalid {
                    reason: format!("mch_id {} does not match merchant", mch_id),
                };
            }
        }
        if wechat_md5_verify(fields, &self.config.api_key, sign) {
            SignatureCheck::Valid
        } else {
            SignatureCheck::Invalid {
                reason: "MD5 signature mismatch".to_string(),
            }
        }
    }

    fn notification_status(fields: &BTreeMap<String, String>) -> ExternalStatus {
        let return_code = fields.get("return_code").map(String::as_str).unwrap_or("");
        let result_code = fields.get("result_code").map(String::as_str).unwrap_or("");
        if return_code == SUCCESS && result_code == SUCCESS {
            return ExternalStatus::Success;
        }
        let reason = fields
            .get("err_code_des")
            .or_else(|| fields.get("return_msg"))
            .filter(|r| !r.is_empty())
            .cloned()
            .unwrap_or_else(|| format!("return_code={} result_code={}", return_code, result_code));
        ExternalStatus::Failed { reason }
    }
}

#[async_trait]
impl PaymentGateway for WechatProvider {
    async fn create_payment(&self, request: &GatewayOrderRequest) -> PaymentResult<PaymentArtifact> {
        if request.payable_minor_units <= 0 {
            return Err(PaymentError::ValidationError {
                message: "total_fee must be positive".to_string(),
                field: Some("total_fee".to_string()),
            });
        }

        let params = self.unified_order_params(request);
        let response_text = self
            .http_client
            .post_text(
                "wechat",
                &self.config.unified_order_url,
                "application/xml",
                to_xml(&params),
            )
            .await?;
        let response = parse_xml_fields(&response_text)?;

        if response.get("return_code").map(String::as_str) != Some(SUCCESS) {
            let message = response
                .get("return_msg")
                .cloned()
                .unwrap_or_else(|| "unified order rejected".to_string());
            warn!(order_id = %request.order_id, message = %message, "wechat unified order rejected");
            return Err(PaymentError::GatewayCallFailed {
                gateway: "wechat".to_string(),
                message,
                gateway_code: response.get("return_code").cloned(),
                retryable: false,
            });
        }

        if response.contains_key("sign") && !wechat_md5_verify(&response, &self.config.api_key, &response["sign"]) {
            return Err(PaymentError::SignatureInvalid {
                gateway: "wechat".to_string(),
                message: "unified order response signature mismatch".to_string(),
            });
        }

        if response.get("result_code").map(String::as_str) != Some(SUCCESS) {
            let message = response
                .get("err_code_des")
                .cloned()
                .unwrap_or_else(|| "unified order failed".to_string());
            warn!(order_id = %request.order_id, message = %message, "wechat unified order failed");
            return Err(PaymentError::GatewayCallFailed {
                gateway: "wechat".to_string(),
                message,
                gateway_code: response.get("err_code").cloned(),
                retryable: response.get("err_code").map(String::as_str) == Some("SYSTEMERROR"),
            });
        }

        let code_url = response
            .get("code_url")
            .filter(|c| !c.is_empty())
            .cloned()
            .ok_or_else(|| PaymentError::GatewayCallFailed {
                gateway: "wechat".to_string(),
                message: "unified order response carries no code_url".to_string(),
                gateway_code: None,
                retryable: false,
            })?;
        let prepay_id = response.get("prepay_id").cloned().unwrap_or_default();

        info!(order_id = %request.order_id, prepay_id = %prepay_id, "wechat native order issued");

        let mut fields = BTreeMap::new();
        fields.insert("code_url".to_string(), code_url.clone());
        fields.insert("prepay_id".to_string(), prepay_id);
        Ok(PaymentArtifact {
            redirect_target: code_url,
            fields,
        })
    }

    async fn parse_callback(&self, callback: &RawCallback) -> PaymentResult<CallbackNotice> {
        let fields = parse_xml_fields(&callback.body)?;
        if fields.is_empty() {
            return Err(PaymentError::MalformedCallback {
                message: "wechat notification carries no fields".to_string(),
            });
        }

        let order_id = fields
            .get("out_trade_no")
            .filter(|v| !v.trim().is_empty())
            .cloned()
            .ok_or_else(|| PaymentError::MalformedCallback {
                message: "wechat notification missing out_trade_no".to_string(),
            })?;

        let signature = self.check_signature(&fields);
        if let SignatureCheck::Invalid { reason } = &signature {
            warn!(order_id = %order_id, reason = %reason, "wechat notification failed verification");
        }

        Ok(CallbackNotice {
            gateway: GatewayName::Wechat,
            order_id,
            external_status: Self::notification_status(&fields),
            signature,
            fields,
        })
    }

    fn name(&self) -> GatewayName {
        GatewayName::Wechat
    }
}

/// Serializes a flat field map as `<xml><name>value</name>...</xml>`.
pub fn to_xml(fields: &BTreeMap<String, String>) -> String {
    let mut xml = String::from("<xml>");
    for (name, value) in fields {
        xml.push('<');
        xml.push_str(name);
        xml.push('>');
        xml.push_str(&quick_xml::escape::escape(value.as_str()));
        xml.push_str("</");
        xml.push_str(name);
        xml.push('>');
    }
    xml.push_str("</xml>");
    xml
}

/// Reads the direct children of the root element into a map. Text and CDATA
/// content are both accepted.
pub fn parse_xml_fields(xml: &str) -> PaymentResult<BTreeMap<String, String>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let malformed = |message: String| PaymentError::MalformedCallback { message };
    let mut fields = BTreeMap::new();
    let mut depth = 0usize;
    let mut current: Option<String> = None;
    let mut value = String::new();
    let mut saw_root = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) => {
                depth += 1;
                if depth == 1 {
                    saw_root = true;
                } else if depth == 2 {
                    current = Some(String::from_utf8_lossy(element.name().as_ref()).into_owned());
                    value.clear();
                }
            }
            Ok(Event::Empty(element)) => {
                if depth == 1 {
                    let name = String::from_utf8_lossy(element.name().as_ref()).into_owned();
                    fields.entry(name).or_insert_with(String::new);
                } else if depth == 0 {
                    saw_root = true;
                }
            }
            Ok(Event::Text(text)) => {
                if depth == 2 {
                    let unescaped = text
                        .unescape()
                        .map_err(|e| malformed(format!("invalid xml text: {}", e)))?;
                    value.push_str(&unescaped);
                }
            }
            Ok(Event::CData(data)) => {
                if depth == 2 {
                    value.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Ok(Event::End(_)) => {
                if depth == 2 {
                    if let Some(name) = current.take() {
                        fields.entry(name).or_insert_with(|| value.clone());
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(malformed(format!("invalid xml: {}", e))),
        }
    }

    if !saw_root {
        return Err(malformed("xml document has no root element".to_string()));
    }
    if depth != 0 {
        return Err(malformed("xml document is truncated".to_string()));
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Router};
    use std::sync::{Arc, Mutex};

    fn config(url: &str) -> WechatConfig {
        WechatConfig {
            app_id: "wx2421b1c4370ec43b".to_string(),
            mch_id: "10000100".to_string(),
            api_key: "192006250b4c09247ec02edce69f6a2d".to_string(),
            unified_order_url: url.to_string(),
            notify_url: "https://topup.example.com/api/payment/callback/wechat".to_string(),
            timeout_secs: 5,
        }
    }

    fn order_request() -> GatewayOrderRequest {
        GatewayOrderRequest {
            order_id: "PAY71700000000001a2b".to_string(),
            quota_amount: 5_000_000,
            payable_amount: "10.00".to_string(),
            payable_minor_units: 1000,
            subject: "Quota top-up".to_string(),
            body: "Top up 5000000 quota".to_string(),
            client_ip: "203.0.113.7".to_string(),
        }
    }

    fn signed_xml(mut fields: BTreeMap<String, String>, key: &str) -> String {
        let sign = wechat_md5_sign(&fields, key);
        fields.insert("sign".to_string(), sign);
        to_xml(&fields)
    }

    async fn spawn_gateway(reply: String, seen: Arc<Mutex<Option<String>>>) -> String {
        let app = Router::new().route(
            "/pay/unifiedorder",
            post(move |body: String| {
                let reply = reply.clone();
                let seen = seen.clone();
                async move {
                    if let Ok(mut slot) = seen.lock() {
                        *slot = Some(body);
                    }
                    reply
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{}/pay/unifiedorder", addr)
    }

    #[test]
    fn missing_settings_are_config_incomplete() {
        let mut cfg = config(WECHAT_UNIFIED_ORDER_URL);
        cfg.api_key.clear();
        match WechatProvider::new(cfg) {
            Err(PaymentError::ConfigIncomplete { gateway, missing }) => {
                assert_eq!(gateway, "wechat");
                assert_eq!(missing, vec!["WECHAT_KEY"]);
            }
            other => panic!("unexpected result: {:?}", other.err()),
        }
    }

    #[test]
    fn xml_parser_reads_text_and_cdata() {
        let fields = parse_xml_fields(
            "<xml><return_code><![CDATA[SUCCESS]]></return_code><total_fee>1000</total_fee><attach/><note>a &amp; b</note></xml>",
        )
        .expect("xml should parse");
        assert_eq!(fields["return_code"], "SUCCESS");
        assert_eq!(fields["total_fee"], "1000");
        assert_eq!(fields["attach"], "");
        assert_eq!(fields["note"], "a & b");
    }

    #[test]
    fn xml_parser_rejects_garbage() {
        assert!(matches!(
            parse_xml_fields("not xml at all"),
            Err(PaymentError::MalformedCallback { .. })
        ));
        assert!(matches!(
            parse_xml_fields("<xml><a>1</a>"),
            Err(PaymentError::MalformedCallback { .. })
        ));
    }

    #[test]
    fn xml_writer_escapes_values() {
        let mut fields = BTreeMap::new();
        fields.insert("body".to_string(), "a<b>&c".to_string());
        let xml = to_xml(&fields);
        assert_eq!(parse_xml_fields(&xml).expect("parse")["body"], "a<b>&c");
    }

    #[tokio::test]
    async fn unified_order_returns_code_url_and_sends_minor_units() {
        let key = "192006250b4c09247ec02edce69f6a2d";
        let mut reply = BTreeMap::new();
        reply.insert("return_code".to_string(), "SUCCESS".to_string());
        reply.insert("result_code".to_string(), "SUCCESS".to_string());
        reply.insert("prepay_id".to_string(), "wx201410272009395522657a690389285100".to_string());
        reply.insert("code_url".to_string(), "weixin://wxpay/bizpayurl?pr=abc123".to_string());
        let seen = Arc::new(Mutex::new(None));
        let url = spawn_gateway(signed_xml(reply, key), seen.clone()).await;

        let provider = WechatProvider::new(config(&url)).expect("provider");
        let artifact = provider
            .create_payment(&order_request())
            .await
            .expect("unified order should succeed");
        assert_eq!(artifact.redirect_target, "weixin://wxpay/bizpayurl?pr=abc123");
        assert_eq!(artifact.fields["prepay_id"], "wx201410272009395522657a690389285100");

        let sent = seen.lock().expect("lock").clone().expect("request captured");
        let sent = parse_xml_fields(&sent).expect("request is xml");
        assert_eq!(sent["total_fee"], "1000");
        assert_eq!(sent["trade_type"], "NATIVE");
        assert_eq!(sent["spbill_create_ip"], "203.0.113.7");
        assert!(wechat_md5_verify(&sent, key, &sent["sign"]));
    }

    #[tokio::test]
    async fn unified_order_failure_is_gateway_call_failed() {
        let reply = "<xml><return_code>FAIL</return_code><return_msg>invalid appid</return_msg></xml>";
        let url = spawn_gateway(reply.to_string(), Arc::new(Mutex::new(None))).await;
        let provider = WechatProvider::new(config(&url)).expect("provider");
        let err = provider
            .create_payment(&order_request())
            .await
            .expect_err("must fail");
        match err {
            PaymentError::GatewayCallFailed { message, .. } => assert_eq!(message, "invalid appid"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_gateway_is_network_error() {
        let provider = WechatProvider::new(config("http://127.0.0.1:1/pay/unifiedorder")).expect("provider");
        let err = provider
            .create_payment(&order_request())
            .await
            .expect_err("must fail");
        assert!(matches!(err, PaymentError::NetworkError { .. }));
    }

    #[tokio::test]
    async fn signed_notification_is_valid_success() {
        let provider = WechatProvider::new(config(WECHAT_UNIFIED_ORDER_URL)).expect("provider");
        let mut fields = BTreeMap::new();
        fields.insert("return_code".to_string(), "SUCCESS".to_string());
        fields.insert("result_code".to_string(), "SUCCESS".to_string());
        fields.insert("mch_id".to_string(), "10000100".to_string());
        fields.insert("out_trade_no".to_string(), "PAY71700000000001a2b".to_string());
        fields.insert("total_fee".to_string(), "1000".to_string());
        let body = signed_xml(fields, "192006250b4c09247ec02edce69f6a2d");

        let notice = provider
            .parse_callback(&RawCallback::from_body(body))
            .await
            .expect("should parse");
        assert_eq!(notice.order_id, "PAY71700000000001a2b");
        assert_eq!(notice.external_status, ExternalStatus::Success);
        assert_eq!(notice.signature, SignatureCheck::Valid);
    }

    #[tokio::test]
    async fn notification_signed_with_other_key_is_invalid() {
        let provider = WechatProvider::new(config(WECHAT_UNIFIED_ORDER_URL)).expect("provider");
        let mut fields = BTreeMap::new();
        fields.insert("return_code".to_string(), "SUCCESS".to_string());
        fields.insert("result_code".to_string(), "FAIL".to_string());
        fields.insert("err_code_des".to_string(), "insufficient balance".to_string());
        fields.insert("out_trade_no".to_string(), "PAY1".to_string());
        let body = signed_xml(fields, "another-merchant-key");

        let notice = provider
            .parse_callback(&RawCallback::from_body(body))
            .await
            .expect("should parse");
        assert!(matches!(notice.signature, SignatureCheck::Invalid { .. }));
        assert_eq!(
            notice.external_status,
            ExternalStatus::Failed {
                reason: "insufficient balance".to_string()
            }
        );
    }
}
