pub mod alipay;
pub mod paypal;
pub mod wechat;

pub use alipay::{AlipayConfig, AlipayProvider, ALIPAY_GATEWAY_URL};
pub use paypal::{PaypalConfig, PaypalProvider, PAYPAL_IPN_VERIFY_URL, PAYPAL_WEBSCR_URL};
pub use wechat::{WechatConfig, WechatProvider, WECHAT_UNIFIED_ORDER_URL};
