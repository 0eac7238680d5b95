//! Dynamic chain parameters
//!
//! Governed values that chain administrators may change through chain-data
//! messages. Every accepted set must lie within the hard bounds below.

use super::{PocError, PocResult};
use serde::{Deserialize, Serialize};

/// Smallest currency unit count per coin
pub const COIN: u64 = 100_000_000;

pub const MIN_BLOCK_SPACING: u32 = 30;
pub const MAX_BLOCK_SPACING: u32 = 60 * 60;
pub const MIN_DUST_THRESHOLD: u64 = 0;
pub const MAX_DUST_THRESHOLD: u64 = COIN;
pub const MIN_TX_FEE: u64 = 0;
pub const MAX_TX_FEE: u64 = COIN;
pub const MIN_BLOCKS_TO_CONSIDER: u32 = 1;
pub const MAX_BLOCKS_TO_CONSIDER: u32 = 100;
pub const MIN_SIG_PERCENTAGE: u32 = 33;
pub const MAX_SIG_PERCENTAGE: u32 = 100;
pub const MIN_BLOCK_SIZE: u32 = 100_000;
pub const MAX_BLOCK_SIZE: u32 = 5_000_000;
pub const MIN_ADMIN_SIGS: u32 = 1;
pub const MAX_ADMIN_SIGS: u32 = 11;

/// Governed chain parameters
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicChainParams {
    /// Target seconds between blocks, also the rotation slot length
    pub block_spacing: u32,
    pub dust_threshold: u64,
    pub tx_fee_threshold: u64,
    /// Trailing blocks inspected for creator eligibility
    pub blocks_to_consider_for_sig_check: u32,
    /// Percentage of active validators that must co-sign
    pub percentage_of_signatures_mean: u32,
    pub max_block_size: u32,
    /// Admin signatures required on a chain-data message
    pub min_admin_sigs: u32,
    /// Admin signatures accepted on a chain-data message
    pub max_admin_sigs: u32,
}

impl Default for DynamicChainParams {
    fn default() -> Self {
        Self {
            block_spacing: 180,
            dust_threshold: COIN / 10_000,
            tx_fee_threshold: COIN / 1_000,
            blocks_to_consider_for_sig_check: 10,
            percentage_of_signatures_mean: 70,
            max_block_size: 2_000_000,
            min_admin_sigs: 1,
            max_admin_sigs: 5,
        }
    }
}

fn check_range<T: PartialOrd + std::fmt::Display>(
    name: &str,
    value: T,
    min: T,
    max: T,
) -> PocResult<()> {
    if value < min || value > max {
        return Err(PocError::InvalidChainData(format!(
            "{name} {value} outside [{min}, {max}]"
        )));
    }
    Ok(())
}

/// Check every field against its hard bounds.
pub fn check_dynamic_chain_parameters(params: &DynamicChainParams) -> PocResult<()> {
    check_range(
        "block spacing",
        params.block_spacing,
        MIN_BLOCK_SPACING,
        MAX_BLOCK_SPACING,
    )?;
    check_range(
        "dust threshold",
        params.dust_threshold,
        MIN_DUST_THRESHOLD,
        MAX_DUST_THRESHOLD,
    )?;
    check_range(
        "tx fee threshold",
        params.tx_fee_threshold,
        MIN_TX_FEE,
        MAX_TX_FEE,
    )?;
    check_range(
        "blocks to consider",
        params.blocks_to_consider_for_sig_check,
        MIN_BLOCKS_TO_CONSIDER,
        MAX_BLOCKS_TO_CONSIDER,
    )?;
    check_range(
        "signature percentage",
        params.percentage_of_signatures_mean,
        MIN_SIG_PERCENTAGE,
        MAX_SIG_PERCENTAGE,
    )?;
    check_range(
        "max block size",
        params.max_block_size,
        MIN_BLOCK_SIZE,
        MAX_BLOCK_SIZE,
    )?;
    check_range(
        "min admin signatures",
        params.min_admin_sigs,
        MIN_ADMIN_SIGS,
        MAX_ADMIN_SIGS,
    )?;
    check_range(
        "max admin signatures",
        params.max_admin_sigs,
        MIN_ADMIN_SIGS,
        MAX_ADMIN_SIGS,
    )?;
    if params.min_admin_sigs > params.max_admin_sigs {
        return Err(PocError::InvalidChainData(format!(
            "min admin signatures {} above max {}",
            params.min_admin_sigs, params.max_admin_sigs
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_within_bounds() {
        assert!(check_dynamic_chain_parameters(&DynamicChainParams::default()).is_ok());
    }

    #[test]
    fn test_block_spacing_below_floor_rejected() {
        let params = DynamicChainParams {
            block_spacing: 10,
            ..Default::default()
        };
        let err = check_dynamic_chain_parameters(&params).unwrap_err();
        assert!(err.to_string().contains("block spacing"));
    }

    #[test]
    fn test_bounds_are_inclusive() {
        let params = DynamicChainParams {
            block_spacing: MAX_BLOCK_SPACING,
            dust_threshold: MAX_DUST_THRESHOLD,
            percentage_of_signatures_mean: MIN_SIG_PERCENTAGE,
            max_block_size: MIN_BLOCK_SIZE,
            ..Default::default()
        };
        assert!(check_dynamic_chain_parameters(&params).is_ok());
    }

    #[test]
    fn test_each_field_checked() {
        let base = DynamicChainParams::default();
        let cases = [
            DynamicChainParams { tx_fee_threshold: COIN + 1, ..base },
            DynamicChainParams { blocks_to_consider_for_sig_check: 0, ..base },
            DynamicChainParams { percentage_of_signatures_mean: 101, ..base },
            DynamicChainParams { max_block_size: MAX_BLOCK_SIZE + 1, ..base },
            DynamicChainParams { min_admin_sigs: 0, ..base },
            DynamicChainParams { min_admin_sigs: 4, max_admin_sigs: 3, ..base },
        ];
        for params in cases {
            assert!(check_dynamic_chain_parameters(&params).is_err(), "{params:?}");
        }
    }
}
