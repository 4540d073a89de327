//! Quota top-up backend
//!
//! Users buy quota through Alipay, WeChat Pay or PayPal. Orders are created
//! `pending`, priced by [`services::amount_policy::AmountPolicy`], and settled
//! exactly once by [`services::order_lifecycle::OrderLifecycle`] when the
//! gateway's signed notification arrives.

pub mod api;
pub mod config;
pub mod database;
pub mod error;
pub mod health;
pub mod logging;
pub mod middleware;
pub mod payments;
pub mod services;
pub mod workers;
