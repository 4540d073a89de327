use crate::payments::error::PaymentResult;
use crate::payments::types::{
    CallbackNotice, GatewayName, GatewayOrderRequest, PaymentArtifact, RawCallback,
};
use async_trait::async_trait;

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Builds and issues the gateway order, returning what the payer needs.
    async fn create_payment(&self, request: &GatewayOrderRequest) -> PaymentResult<PaymentArtifact>;

    /// Parses an inbound notification and authenticates it.
    ///
    /// A bad signature is reported through `CallbackNotice::signature`, not as
    /// an error; only unparseable payloads fail.
    async fn parse_callback(&self, callback: &RawCallback) -> PaymentResult<CallbackNotice>;

    fn name(&self) -> GatewayName;
}
