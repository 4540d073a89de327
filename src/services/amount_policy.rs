//! Converts a requested currency amount into quota, applying an optional
//! top-up discount code.

use crate::database::discount_code_repository::DiscountCodeStore;
use bigdecimal::{BigDecimal, RoundingMode, ToPrimitive, Zero};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountPolicyError {
    #[error("amount must be greater than zero, got {amount}")]
    InvalidAmount { amount: String },

    #[error("quota for amount {amount} does not fit in a 64-bit counter")]
    QuotaOverflow { amount: String },

    #[error("quota per currency unit must be greater than zero, got {rate}")]
    InvalidUnitRate { rate: String },
}

/// Result of pricing a top-up request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AmountQuote {
    pub effective_amount: BigDecimal,
    pub quota_count: i64,
    /// The code that was actually applied, if any.
    pub discount_code: Option<String>,
}

pub struct AmountPolicy {
    codes: Arc<dyn DiscountCodeStore>,
    unit_rate: BigDecimal,
}

impl AmountPolicy {
    pub fn new(
        codes: Arc<dyn DiscountCodeStore>,
        unit_rate: BigDecimal,
    ) -> Result<Self, AmountPolicyError> {
        if unit_rate <= BigDecimal::zero() {
            return Err(AmountPolicyError::InvalidUnitRate {
                rate: unit_rate.to_string(),
            });
        }
        Ok(Self { codes, unit_rate })
    }

    pub fn unit_rate(&self) -> &BigDecimal {
        &self.unit_rate
    }

    /// `quota = floor(effective * unit_rate)` where `effective` is the amount
    /// after an enabled code's ratio is taken off. Unknown, disabled or
    /// unreadable codes price the request as if no code had been given.
    pub async fn compute(
        &self,
        amount: &BigDecimal,
        code: Option<&str>,
    ) -> Result<AmountQuote, AmountPolicyError> {
        if *amount <= BigDecimal::zero() {
            return Err(AmountPolicyError::InvalidAmount {
                amount: amount.to_string(),
            });
        }

        let mut effective_amount = amount.clone();
        let mut applied = None;

        if let Some(code) = code.map(str::trim).filter(|c| !c.is_empty()) {
            if let Some(ratio) = self.discount_ratio(code).await {
                effective_amount = amount * (BigDecimal::from(1) - &ratio);
                applied = Some(code.to_string());
                debug!(code = %code, ratio = %ratio, "discount code applied");
            }
        }

        let quota_count = self.quota_for(&effective_amount)?;
        Ok(AmountQuote {
            effective_amount: effective_amount.normalized(),
            quota_count,
            discount_code: applied,
        })
    }

    pub fn quota_for(&self, effective_amount: &BigDecimal) -> Result<i64, AmountPolicyError> {
        (effective_amount * &self.unit_rate)
            .with_scale_round(0, RoundingMode::Floor)
            .to_i64()
            .ok_or_else(|| AmountPolicyError::QuotaOverflow {
                amount: effective_amount.to_string(),
            })
    }

    /// Currency amount to charge for `quota`, rounded to cents.
    pub fn payable_for_quota(&self, quota: i64) -> BigDecimal {
        (BigDecimal::from(quota) / &self.unit_rate).with_scale_round(2, RoundingMode::HalfUp)
    }

    async fn discount_ratio(&self, code: &str) -> Option<BigDecimal> {
        let found = match self.codes.find_enabled(code).await {
            Ok(found) => found?,
            Err(e) => {
                warn!(code = %code, error = %e, "discount code lookup failed; pricing without discount");
                return None;
            }
        };

        let ratio = found.discount_ratio;
        if ratio < BigDecimal::zero() || ratio >= BigDecimal::from(1) {
            warn!(code = %code, ratio = %ratio, "discount ratio outside [0, 1); ignoring code");
            return None;
        }
        Some(ratio)
    }
}

/// Minor units (cents / fen) for a two-decimal amount.
pub fn to_minor_units(amount: &BigDecimal) -> Option<i64> {
    (amount * BigDecimal::from(100))
        .with_scale_round(0, RoundingMode::HalfUp)
        .to_i64()
}
