//! Wallet identity and shard math.
//!
//! Only public identity crosses this type. Key material lives behind the
//! [`crate::traits::KeyProvider`] seam and never enters the scheduler.

use serde::{Deserialize, Serialize};

/// Public identity of a managed wallet on one chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WalletRef {
    pub address: String,
    pub chain: String,
    pub shard_id: u32,
}

impl WalletRef {
    pub fn new(address: impl Into<String>, chain: impl Into<String>, shard_id: u32) -> Self {
        Self {
            address: address.into(),
            chain: chain.into(),
            shard_id,
        }
    }

    /// Short display form for logs: first 6 + last 4 chars of the address.
    pub fn short(&self) -> String {
        if self.address.len() > 12 {
            format!(
                "{}..{}",
                &self.address[..6],
                &self.address[self.address.len() - 4..]
            )
        } else {
            self.address.clone()
        }
    }
}

/// Shard index for the i-th wallet in a fleet, `shard_size` wallets per shard.
pub fn shard_for_index(index: usize, shard_size: usize) -> u32 {
    if shard_size == 0 {
        return 0;
    }
    (index / shard_size) as u32
}
