//! Gas pricing and the net-profit gate.
//!
//! All values are wei. The gate runs twice per attempt: once with the
//! cached gas estimate before the first relay simulation, and again with
//! the simulated gas use before the bundle is finalized.

use alloy::primitives::U256;
use flash_data::registry::{Settings, ThresholdSetting};

/// EIP-1559 fee fields for one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasParams {
    pub gas_limit: u64,
    pub max_fee_per_gas: u128,
    pub max_priority_fee_per_gas: u128,
}

impl GasParams {
    /// Price actually paid per gas: `min(max_fee, base_fee + priority_fee)`.
    pub fn effective_price(&self, base_fee: u128) -> u128 {
        self.max_fee_per_gas
            .min(base_fee.saturating_add(self.max_priority_fee_per_gas))
    }
}

/// Minimum net profit a submission must clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfitThreshold {
    /// Net profit must exceed this many wei.
    Absolute(u128),
    /// Net profit must exceed `numerator / denominator` of the gas cost.
    GasMultiple { numerator: u128, denominator: u128 },
}

impl From<ThresholdSetting> for ProfitThreshold {
    fn from(setting: ThresholdSetting) -> Self {
        match setting {
            ThresholdSetting::AbsoluteWei(wei) => ProfitThreshold::Absolute(wei),
            ThresholdSetting::GasMultiplePct(pct) => ProfitThreshold::GasMultiple {
                numerator: u128::from(pct),
                denominator: 100,
            },
        }
    }
}

impl ProfitThreshold {
    /// Threshold in wei for a transaction costing `gas_cost`.
    pub fn minimum(&self, gas_cost: u128) -> u128 {
        match *self {
            ProfitThreshold::Absolute(wei) => wei,
            ProfitThreshold::GasMultiple {
                numerator,
                denominator,
            } => gas_cost.saturating_mul(numerator) / denominator.max(1),
        }
    }
}

/// Profit gate, fee policy and bribe sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfitGate {
    pub threshold: ProfitThreshold,
    pub default_gas: u64,
    pub max_gas_limit: u64,
    pub gas_limit_pct: u64,
    pub max_fee_pct: u64,
    pub miner_tip_pct: u64,
}

impl ProfitGate {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            threshold: settings.profit_threshold.into(),
            default_gas: settings.gas_estimate,
            max_gas_limit: settings.max_gas_limit,
            gas_limit_pct: settings.gas_limit_pct,
            max_fee_pct: settings.max_fee_pct,
            miner_tip_pct: settings.miner_tip_pct,
        }
    }

    /// Fee fields for a transaction expected to use `gas_estimate` gas.
    ///
    /// The limit is padded by `gas_limit_pct` and capped at `max_gas_limit`;
    /// the max fee leaves `max_fee_pct` headroom over the base fee on top
    /// of the priority fee.
    pub fn gas_params(&self, gas_estimate: u64, base_fee: u128, priority_fee: u128) -> GasParams {
        let padded = gas_estimate.saturating_mul(self.gas_limit_pct) / 100;
        let headroom = base_fee.saturating_mul(u128::from(self.max_fee_pct)) / 100;
        GasParams {
            gas_limit: padded.clamp(gas_estimate.min(self.max_gas_limit), self.max_gas_limit),
            max_fee_per_gas: headroom.saturating_add(priority_fee),
            max_priority_fee_per_gas: priority_fee,
        }
    }

    /// `profit - gas × price`, or `None` when gas eats the whole profit.
    pub fn net_profit(&self, profit: U256, gas: u64, price: u128) -> Option<u128> {
        let profit = u128::try_from(profit).ok()?;
        let cost = u128::from(gas).checked_mul(price)?;
        profit.checked_sub(cost).filter(|net| *net > 0)
    }

    /// Whether `net` clears the configured threshold for `gas_cost`.
    pub fn passes(&self, net: u128, gas_cost: u128) -> bool {
        net > self.threshold.minimum(gas_cost)
    }

    /// Builder payment taken out of `net`.
    pub fn bribe(&self, net: u128) -> u128 {
        net.saturating_mul(u128::from(self.miner_tip_pct)) / 100
    }

    /// Bribe spread over the expected gas use as a priority fee.
    pub fn priority_fee_for(&self, bribe: u128, gas: u64) -> u128 {
        bribe / u128::from(gas.max(1))
    }
}

/// Formats wei as fixed-precision ETH with six decimals.
pub fn format_eth(wei: u128) -> String {
    const WEI_PER_ETH: u128 = 1_000_000_000_000_000_000;
    const SCALE: u128 = 1_000_000;

    let whole = wei / WEI_PER_ETH;
    let fractional = ((wei % WEI_PER_ETH) * SCALE) / WEI_PER_ETH;

    format!("{whole}.{fractional:06} ETH")
}
