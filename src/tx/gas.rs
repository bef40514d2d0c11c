//! Fee estimation and escalation for legacy and EIP-1559 chains
//!
//! The estimator is a pure policy object: it reads its bounds from the fee
//! configuration and never talks to the chain.

use crate::config::FeeConfig;

use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Gas price types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

impl GasPrice {
    /// The price bounded by the configured ceiling: legacy price or fee cap
    pub fn cap(&self) -> U256 {
        match self {
            GasPrice::Legacy(price) => *price,
            GasPrice::Eip1559 {
                max_fee_per_gas, ..
            } => *max_fee_per_gas,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeeError {
    #[error("fee ceiling reached: {previous} cannot be raised under ceiling {ceiling}")]
    Exhausted { previous: U256, ceiling: U256 },
}

/// Computes initial and escalated fee parameters within configured bounds
#[derive(Debug, Clone)]
pub struct FeeEstimator {
    config: FeeConfig,
}

impl FeeEstimator {
    pub fn new(config: FeeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FeeConfig {
        &self.config
    }

    /// Gas limit for a request, falling back to the configured default
    pub fn gas_limit(&self, requested: Option<u64>) -> u64 {
        requested.unwrap_or(self.config.limit_default)
    }

    /// Fee parameters for a first attempt
    pub fn initial(&self, from: Address) -> GasPrice {
        let ceiling = self.config.price_max_key(from);
        let price = clamp(self.config.price_default(), self.config.price_min(), ceiling);

        if self.config.eip1559_dynamic_fees {
            let tip = clamp(
                self.config.tip_cap_default(),
                self.config.tip_cap_min(),
                price,
            );
            GasPrice::Eip1559 {
                max_fee_per_gas: price,
                max_priority_fee_per_gas: tip,
            }
        } else {
            GasPrice::Legacy(price)
        }
    }

    /// Fee parameters for a replacement of `previous`.
    ///
    /// Every component must strictly increase; otherwise the escalation is
    /// exhausted and the transaction cannot be re-priced under its ceiling.
    pub fn bump(&self, from: Address, previous: &GasPrice) -> Result<GasPrice, FeeError> {
        let ceiling = self.config.price_max_key(from);

        match *previous {
            GasPrice::Legacy(price) => {
                let next = self.bumped(price).max(self.config.price_min()).min(ceiling);
                if next <= price {
                    return Err(FeeError::Exhausted {
                        previous: price,
                        ceiling,
                    });
                }
                Ok(GasPrice::Legacy(next))
            }
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let fee_cap = self
                    .bumped(max_fee_per_gas)
                    .max(self.config.price_min())
                    .min(ceiling);
                let tip = self
                    .bumped(max_priority_fee_per_gas)
                    .max(self.config.tip_cap_min())
                    .min(fee_cap);
                if fee_cap <= max_fee_per_gas || tip <= max_priority_fee_per_gas {
                    return Err(FeeError::Exhausted {
                        previous: max_fee_per_gas,
                        ceiling,
                    });
                }
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: fee_cap,
                    max_priority_fee_per_gas: tip,
                })
            }
        }
    }

    /// max(price * (1 + percent / 100), price + minimum increment), where the
    /// increment is never below 1 wei
    fn bumped(&self, price: U256) -> U256 {
        let by_percent =
            price.saturating_mul(U256::from(100u64 + self.config.bump_percent as u64))
                / U256::from(100u64);
        let increment = self.config.bump_min().max(U256::one());
        by_percent.max(price.saturating_add(increment))
    }
}

fn clamp(value: U256, min: U256, max: U256) -> U256 {
    value.max(min).min(max)
}
