use crate::chain::sdk::{ActiveBin, CreatePositionRequest, CreatedPosition, DlmmSdk, OnchainPosition};
use crate::error::ChainError;
use crate::models::PoolDescriptor;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::transaction::Transaction;
use std::sync::Arc;

/// Price of `bin_id` relative to the active bin. Bins step geometrically:
/// each bin is `1 + bin_step/10000` times the previous one.
pub fn price_for_bin(bin_step_bps: u16, active: &ActiveBin, bin_id: i32) -> f64 {
    let step = 1.0 + bin_step_bps as f64 / 10_000.0;
    active.price * step.powi(bin_id - active.bin_id)
}

/// Inverse of [`price_for_bin`]: the bin a price falls into, relative to
/// the active bin. This is the canonical conversion, SDK output is never
/// consulted.
pub fn bin_id_for_price(bin_step_bps: u16, active: &ActiveBin, price: f64) -> i32 {
    let step = 1.0 + bin_step_bps as f64 / 10_000.0;
    active.bin_id + ((price / active.price).ln() / step.ln()).round() as i32
}

/// Thin adapter over one DLMM pool: canonical bin math plus pass-through
/// of the SDK operations, pinned to this pool's id.
pub struct PoolClient {
    descriptor: PoolDescriptor,
    sdk: Arc<dyn DlmmSdk>,
}

impl PoolClient {
    pub fn new(descriptor: PoolDescriptor, sdk: Arc<dyn DlmmSdk>) -> Self {
        Self { descriptor, sdk }
    }

    pub fn descriptor(&self) -> &PoolDescriptor {
        &self.descriptor
    }

    pub fn pool_id(&self) -> Pubkey {
        self.descriptor.pool_id
    }

    pub async fn active_bin(&self) -> Result<ActiveBin, ChainError> {
        self.sdk.active_bin(&self.descriptor.pool_id).await
    }

    pub fn price_for_bin(&self, active: &ActiveBin, bin_id: i32) -> f64 {
        price_for_bin(self.descriptor.bin_step_bps, active, bin_id)
    }

    pub fn bin_id_for_price(&self, active: &ActiveBin, price: f64) -> i32 {
        bin_id_for_price(self.descriptor.bin_step_bps, active, price)
    }

    pub async fn ensure_bin_arrays(
        &self,
        min_bin: i32,
        max_bin: i32,
    ) -> Result<Vec<Transaction>, ChainError> {
        self.sdk
            .ensure_bin_arrays(&self.descriptor.pool_id, min_bin, max_bin)
            .await
    }

    pub async fn create_one_sided_position(
        &self,
        request: &CreatePositionRequest,
    ) -> Result<CreatedPosition, ChainError> {
        self.sdk
            .create_one_sided_position(&self.descriptor.pool_id, request)
            .await
    }

    pub async fn remove_liquidity(
        &self,
        position: &Pubkey,
        from_bin: i32,
        to_bin: i32,
        bps: u16,
        claim_and_close: bool,
    ) -> Result<Vec<Transaction>, ChainError> {
        self.sdk
            .remove_liquidity(
                &self.descriptor.pool_id,
                position,
                from_bin,
                to_bin,
                bps,
                claim_and_close,
            )
            .await
    }

    pub async fn claim_all_rewards(&self, position: &Pubkey) -> Result<Vec<Transaction>, ChainError> {
        self.sdk
            .claim_all_rewards(&self.descriptor.pool_id, position)
            .await
    }

    pub async fn close_position_account(&self, position: &Pubkey) -> Result<Transaction, ChainError> {
        self.sdk
            .close_position_account(&self.descriptor.pool_id, position)
            .await
    }

    pub async fn get_position(&self, position: &Pubkey) -> Result<OnchainPosition, ChainError> {
        self.sdk.get_position(position).await
    }

    pub async fn list_user_positions(&self) -> Result<Vec<Pubkey>, ChainError> {
        self.sdk.list_user_positions(&self.descriptor.pool_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active() -> ActiveBin {
        ActiveBin {
            bin_id: 8_388_608,
            price: 150.0,
        }
    }

    #[test]
    fn test_price_steps_geometrically() {
        let a = active();
        let up_one = price_for_bin(20, &a, a.bin_id + 1);
        assert!((up_one / a.price - 1.002).abs() < 1e-9);

        let down_one = price_for_bin(20, &a, a.bin_id - 1);
        assert!((a.price / down_one - 1.002).abs() < 1e-9);
    }

    #[test]
    fn test_active_bin_maps_to_itself() {
        let a = active();
        assert_eq!(bin_id_for_price(20, &a, a.price), a.bin_id);
        assert_eq!(price_for_bin(20, &a, a.bin_id), a.price);
    }

    #[test]
    fn test_bin_price_roundtrip_near_active() {
        let a = active();
        for step_bps in [1u16, 10, 20, 100] {
            for offset in -300i32..=300 {
                let bin = a.bin_id + offset;
                let price = price_for_bin(step_bps, &a, bin);
                assert_eq!(
                    bin_id_for_price(step_bps, &a, price),
                    bin,
                    "step {} offset {}",
                    step_bps,
                    offset
                );
            }
        }
    }

    #[test]
    fn test_bin_for_intermediate_price_rounds() {
        let a = active();
        // Halfway into the next bin still rounds to the nearest bin id
        let next = price_for_bin(20, &a, a.bin_id + 1);
        let just_above = a.price + (next - a.price) * 0.4;
        assert_eq!(bin_id_for_price(20, &a, just_above), a.bin_id);
    }
}
