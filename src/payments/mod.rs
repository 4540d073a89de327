pub mod error;
pub mod factory;
pub mod provider;
pub mod providers;
pub mod signature;
pub mod types;
pub mod utils;

pub use error::{PaymentError, PaymentResult};
pub use factory::{GatewaySettings, PaymentGatewayFactory};
pub use provider::PaymentGateway;
pub use types::{
    CallbackNotice, ExternalStatus, GatewayName, GatewayOrderRequest, PaymentArtifact,
    RawCallback, SignatureCheck,
};
