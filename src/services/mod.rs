//! Services module for business logic

pub mod amount_policy;
pub mod order_lifecycle;

pub use amount_policy::{AmountPolicy, AmountPolicyError, AmountQuote};
pub use order_lifecycle::{
    CallbackOutcome, CreateOrderRequest, CreatedOrder, LifecycleConfig, LifecycleError,
    OrderLifecycle,
};
