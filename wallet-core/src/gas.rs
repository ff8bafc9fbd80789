//! Gas limit/price bounds for outgoing transfers.
//!
//! `clamp` is used while the user edits values and never fails; `validate`
//! is the strict gate applied right before submission.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::WalletError;

pub const DEFAULT_GAS_LIMIT: u64 = 100_000;
pub const DEFAULT_GAS_PRICE: u64 = 1_000;
pub const MIN_GAS_LIMIT: u64 = 21_000;
pub const MAX_GAS_LIMIT: u64 = 10_000_000;
pub const MIN_GAS_PRICE: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GasConfig {
    pub limit: u64,
    pub price: u64,
    pub limit_lower: u64,
    pub limit_upper: u64,
    pub price_lower: u64,
}

impl GasConfig {
    /// Same bounds as `self`, new limit and price.
    pub fn with_values(&self, limit: u64, price: u64) -> Self {
        Self {
            limit,
            price,
            ..*self
        }
    }
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            limit: DEFAULT_GAS_LIMIT,
            price: DEFAULT_GAS_PRICE,
            limit_lower: MIN_GAS_LIMIT,
            limit_upper: MAX_GAS_LIMIT,
            price_lower: MIN_GAS_PRICE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GasError {
    InvertedBounds { lower: u64, upper: u64 },
    LimitOutOfBounds { limit: u64, lower: u64, upper: u64 },
    PriceBelowFloor { price: u64, floor: u64 },
}

impl fmt::Display for GasError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GasError::InvertedBounds { lower, upper } => {
                write!(f, "gas limit bounds inverted ({} > {})", lower, upper)
            }
            GasError::LimitOutOfBounds {
                limit,
                lower,
                upper,
            } => write!(f, "gas limit {} outside [{}, {}]", limit, lower, upper),
            GasError::PriceBelowFloor { price, floor } => {
                write!(f, "gas price {} below floor {}", price, floor)
            }
        }
    }
}

impl std::error::Error for GasError {}

impl From<GasError> for WalletError {
    fn from(error: GasError) -> Self {
        WalletError::GasOutOfBounds(error.to_string())
    }
}

/// Stateless gas rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct GasPolicy;

impl GasPolicy {
    /// Correct out-of-range values instead of rejecting them.
    ///
    /// Inverted bounds are normalized by raising `limit_upper` to `limit_lower`.
    pub fn clamp(config: GasConfig) -> GasConfig {
        let limit_upper = config.limit_upper.max(config.limit_lower);
        GasConfig {
            limit: config.limit.clamp(config.limit_lower, limit_upper),
            price: config.price.max(config.price_lower),
            limit_lower: config.limit_lower,
            limit_upper,
            price_lower: config.price_lower,
        }
    }

    /// Strict submission-time check: fails whenever `clamp` would alter `config`.
    pub fn validate(config: &GasConfig) -> Result<(), GasError> {
        if config.limit_lower > config.limit_upper {
            return Err(GasError::InvertedBounds {
                lower: config.limit_lower,
                upper: config.limit_upper,
            });
        }
        if config.limit < config.limit_lower || config.limit > config.limit_upper {
            return Err(GasError::LimitOutOfBounds {
                limit: config.limit,
                lower: config.limit_lower,
                upper: config.limit_upper,
            });
        }
        if config.price < config.price_lower {
            return Err(GasError::PriceBelowFloor {
                price: config.price,
                floor: config.price_lower,
            });
        }
        debug_assert_eq!(Self::clamp(*config), *config);
        Ok(())
    }

    pub fn fee(config: &GasConfig) -> u64 {
        config.limit.saturating_mul(config.price)
    }
}
