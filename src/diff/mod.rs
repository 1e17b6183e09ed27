//! Turns decoded calls and logs into normalized diffs and derived state.

pub mod balance;
pub mod nft;
pub mod stake;
pub mod transfers;

pub use balance::{BalanceBook, BlockChanges, Cell, ConsistencyReport};
pub use nft::{NftHoldings, NftLedger};
pub use stake::StakeLedger;
