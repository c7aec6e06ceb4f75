//! Average price calculation
//!
//! Reduces one depth update to the unweighted mean of every bid and ask
//! price in it. Quantities are not used.

use serde::Serialize;
use std::str::FromStr;
use tracing::warn;

use relay_core::{AveragePrice, DepthUpdate, RelayError, RelayResult};

/// How to treat price text that does not parse as a finite number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceParsePolicy {
    /// The level contributes 0 to the sum but still counts in the divisor
    #[default]
    ZeroOnError,
    /// The whole update is rejected
    RejectUpdate,
}

impl FromStr for PriceParsePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "zero" | "zero_on_error" => Ok(PriceParsePolicy::ZeroOnError),
            "reject" | "reject_update" => Ok(PriceParsePolicy::RejectUpdate),
            _ => Err(format!("Unknown price parse policy: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PriceAggregator {
    policy: PriceParsePolicy,
}

impl PriceAggregator {
    pub fn new(policy: PriceParsePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> PriceParsePolicy {
        self.policy
    }

    /// `(sum of bid prices + sum of ask prices) / (bids + asks)`
    ///
    /// Returns `Ok(None)` for an update with no levels: there is nothing
    /// to average and nothing must be emitted.
    pub fn average(&self, update: &DepthUpdate) -> RelayResult<Option<AveragePrice>> {
        let count = update.level_count();
        if count == 0 {
            return Ok(None);
        }

        let mut total = 0.0;
        for level in update.levels() {
            match parse_price(&level.price) {
                Some(price) => total += price,
                None => match self.policy {
                    PriceParsePolicy::ZeroOnError => {
                        warn!(
                            "[Aggregator] Unparsable price {:?} in update {}, counting as 0",
                            level.price, update.update_id
                        );
                    }
                    PriceParsePolicy::RejectUpdate => {
                        return Err(RelayError::decode(format!(
                            "unparsable price {:?} in update {}",
                            level.price, update.update_id
                        )));
                    }
                },
            }
        }

        let average = total / count as f64;
        if !average.is_finite() {
            return Err(RelayError::decode(format!(
                "average for update {} is not finite",
                update.update_id
            )));
        }

        Ok(Some(AveragePrice(average)))
    }
}

fn parse_price(text: &str) -> Option<f64> {
    text.parse::<f64>().ok().filter(|price| price.is_finite())
}
