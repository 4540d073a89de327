use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentGateway;
use crate::payments::types::{
    CallbackNotice, ExternalStatus, GatewayName, GatewayOrderRequest, PaymentArtifact,
    RawCallback, SignatureCheck,
};
use crate::payments::utils::{encode_form_urlencoded, parse_form_urlencoded, PaymentHttpClient};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

pub const PAYPAL_WEBSCR_URL: &str = "https://www.paypal.com/cgi-bin/webscr";
pub const PAYPAL_SANDBOX_WEBSCR_URL: &str = "https://www.sandbox.paypal.com/cgi-bin/webscr";
pub const PAYPAL_IPN_VERIFY_URL: &str = "https://ipnpb.paypal.com/cgi-bin/webscr";
pub const PAYPAL_SANDBOX_IPN_VERIFY_URL: &str = "https://ipnpb.sandbox.paypal.com/cgi-bin/webscr";
const CURRENCY: &str = "USD";

#[derive(Debug, Clone)]
pub struct PaypalConfig {
    /// Receiver account (email or merchant id) used in the buy-now form.
    pub business: String,
    pub webscr_url: String,
    pub ipn_verify_url: String,
    pub notify_url: String,
    pub timeout_secs: u64,
}

impl PaypalConfig {
    pub fn from_env(server_address: &str, timeout_secs: u64) -> Self {
        let sandbox = std::env::var("PAYPAL_SANDBOX")
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);
        let (webscr_url, ipn_verify_url) = if sandbox {
            (PAYPAL_SANDBOX_WEBSCR_URL, PAYPAL_SANDBOX_IPN_VERIFY_URL)
        } else {
            (PAYPAL_WEBSCR_URL, PAYPAL_IPN_VERIFY_URL)
        };
        Self {
            business: std::env::var("PAYPAL_BUSINESS").unwrap_or_default(),
            webscr_url: webscr_url.to_string(),
            ipn_verify_url: ipn_verify_url.to_string(),
            notify_url: format!(
                "{}/api/payment/callback/paypal",
                server_address.trim_end_matches('/')
            ),
            timeout_secs,
        }
    }
}

pub struct PaypalProvider {
    config: PaypalConfig,
    http_client: PaymentHttpClient,
}

impl PaypalProvider {
    pub fn new(config: PaypalConfig) -> PaymentResult<Self> {
        if config.business.trim().is_empty() {
            return Err(PaymentError::config_incomplete("paypal", &["PAYPAL_BUSINESS"]));
        }
        let http_client = PaymentHttpClient::new(Duration::from_secs(config.timeout_secs))?;
        Ok(Self {
            config,
            http_client,
        })
    }

    fn payment_status(fields: &BTreeMap<String, String>) -> ExternalStatus {
        let status = fields.get("payment_status").map(String::as_str).unwrap_or("");
        match status {
            "Completed" => ExternalStatus::Success,
            "Pending" | "In-Progress" | "Processed" => ExternalStatus::InProgress {
                raw_status: status.to_string(),
            },
            "" => ExternalStatus::Failed {
                reason: "missing payment_status".to_string(),
            },
            other => {
                let reason = fields
                    .get("reason_code")
                    .or_else(|| fields.get("pending_reason"))
                    .map(|r| format!("payment_status {} ({})", other, r))
                    .unwrap_or_else(|| format!("payment_status {}", other));
                ExternalStatus::Failed { reason }
            }
        }
    }

    /// Posts the untouched IPN body back to PayPal; only a literal `VERIFIED`
    /// reply authenticates the message.
    async fn verify_ipn(&self, raw_body: &str) -> SignatureCheck {
        let body = format!("cmd=_notify-validate&{}", raw_body.trim());
        match self
            .http_client
            .post_text(
                "paypal",
                &self.config.ipn_verify_url,
                "application/x-www-form-urlencoded",
                body,
            )
            .await
        {
            Ok(reply) if reply.trim() == "VERIFIED" => SignatureCheck::Valid,
            Ok(reply) if reply.trim() == "INVALID" => SignatureCheck::Invalid {
                reason: "IPN post-back answered INVALID".to_string(),
            },
            Ok(reply) => SignatureCheck::Unverified {
                reason: format!("unexpected IPN post-back reply: {}", reply.trim()),
            },
            Err(e) => SignatureCheck::Unverified {
                reason: format!("IPN post-back failed: {}", e),
            },
        }
    }
}

#[async_trait]
impl PaymentGateway for PaypalProvider {
    async fn create_payment(&self, request: &GatewayOrderRequest) -> PaymentResult<PaymentArtifact> {
        let mut form = BTreeMap::new();
        form.insert("cmd".to_string(), "_xclick".to_string());
        form.insert("business".to_string(), self.config.business.clone());
        form.insert("item_name".to_string(), request.subject.clone());
        form.insert("invoice".to_string(), request.order_id.clone());
        form.insert("amount".to_string(), request.payable_amount.clone());
        form.insert("currency_code".to_string(), CURRENCY.to_string());
        form.insert("notify_url".to_string(), self.config.notify_url.clone());
        form.insert("no_shipping".to_string(), "1".to_string());

        let redirect_target = format!("{}?{}", self.config.webscr_url, encode_form_urlencoded(&form));
        info!(order_id = %request.order_id, amount = %request.payable_amount, "paypal checkout link issued");

        let mut fields = BTreeMap::new();
        fields.insert("invoice_id".to_string(), request.order_id.clone());
        fields.insert("amount".to_string(), request.payable_amount.clone());
        fields.insert("currency".to_string(), CURRENCY.to_string());
        fields.insert("description".to_string(), request.body.clone());
        Ok(PaymentArtifact {
            redirect_target,
            fields,
        })
    }

    async fn parse_callback(&self, callback: &RawCallback) -> PaymentResult<CallbackNotice> {
        let fields = parse_form_urlencoded(&callback.body)?;
        if fields.is_empty() {
            return Err(PaymentError::MalformedCallback {
                message: "paypal notification carries no fields".to_string(),
            });
        }

        let order_id = fields
            .get("invoice")
            .or_else(|| fields.get("invoice_id"))
            .filter(|v| !v.trim().is_empty())
            .cloned()
            .ok_or_else(|| PaymentError::MalformedCallback {
                message: "paypal notification missing invoice".to_string(),
            })?;

        let receiver_mismatch = fields
            .get("receiver_email")
            .or_else(|| fields.get("business"))
            .filter(|r| !r.eq_ignore_ascii_case(&self.config.business))
            .cloned();

        let signature = match receiver_mismatch {
            Some(receiver) => SignatureCheck::Invalid {
                reason: format!("receiver {} does not match business account", receiver),
            },
            None => self.verify_ipn(&callback.body).await,
        };
        if !signature.is_valid() {
            warn!(order_id = %order_id, check = ?signature, "paypal notification not verified");
        }

        Ok(CallbackNotice {
            gateway: GatewayName::Paypal,
            order_id,
            external_status: Self::payment_status(&fields),
            signature,
            fields,
        })
    }

    fn name(&self) -> GatewayName {
        GatewayName::Paypal
    }
}
