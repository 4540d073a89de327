use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentGateway;
use crate::payments::providers::{
    AlipayConfig, AlipayProvider, PaypalConfig, PaypalProvider, WechatConfig, WechatProvider,
};
use crate::payments::types::GatewayName;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Immutable settings for every gateway, built once at startup.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub alipay: AlipayConfig,
    pub wechat: WechatConfig,
    pub paypal: PaypalConfig,
}

impl GatewaySettings {
    pub fn from_env(server_address: &str, timeout_secs: u64) -> Self {
        Self {
            alipay: AlipayConfig::from_env(server_address),
            wechat: WechatConfig::from_env(server_address, timeout_secs),
            paypal: PaypalConfig::from_env(server_address, timeout_secs),
        }
    }
}

/// Holds one client per configured gateway. A gateway whose settings are
/// incomplete stays unavailable and reports its construction error on lookup.
pub struct PaymentGatewayFactory {
    gateways: HashMap<GatewayName, Arc<dyn PaymentGateway>>,
    unavailable: HashMap<GatewayName, PaymentError>,
}

impl PaymentGatewayFactory {
    pub fn from_settings(settings: GatewaySettings) -> Self {
        let mut factory = Self {
            gateways: HashMap::new(),
            unavailable: HashMap::new(),
        };

        factory.register_result(
            GatewayName::Alipay,
            AlipayProvider::new(settings.alipay).map(|p| Arc::new(p) as Arc<dyn PaymentGateway>),
        );
        factory.register_result(
            GatewayName::Wechat,
            WechatProvider::new(settings.wechat).map(|p| Arc::new(p) as Arc<dyn PaymentGateway>),
        );
        factory.register_result(
            GatewayName::Paypal,
            PaypalProvider::new(settings.paypal).map(|p| Arc::new(p) as Arc<dyn PaymentGateway>),
        );

        factory
    }

    pub fn with_gateways(gateways: Vec<Arc<dyn PaymentGateway>>) -> Self {
        let mut factory = Self {
            gateways: HashMap::new(),
            unavailable: HashMap::new(),
        };
        for gateway in gateways {
            factory.gateways.insert(gateway.name(), gateway);
        }
        factory
    }

    fn register_result(
        &mut self,
        name: GatewayName,
        result: PaymentResult<Arc<dyn PaymentGateway>>,
    ) {
        match result {
            Ok(gateway) => {
                info!(gateway = %name, "payment gateway enabled");
                self.gateways.insert(name, gateway);
            }
            Err(e) => {
                warn!(gateway = %name, error = %e, "payment gateway unavailable");
                self.unavailable.insert(name, e);
            }
        }
    }

    pub fn get_gateway(&self, name: GatewayName) -> PaymentResult<Arc<dyn PaymentGateway>> {
        if let Some(gateway) = self.gateways.get(&name) {
            return Ok(gateway.clone());
        }
        Err(self
            .unavailable
            .get(&name)
            .cloned()
            .unwrap_or_else(|| PaymentError::config_incomplete(name.as_str(), &[])))
    }

    pub fn list_available_gateways(&self) -> Vec<GatewayName> {
        GatewayName::ALL
            .iter()
            .copied()
            .filter(|name| self.gateways.contains_key(name))
            .collect()
    }
}
