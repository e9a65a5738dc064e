//! Wallet custody module
//!
//! The engine never stores private material: signing capability is resolved
//! per execution batch from the custody collaborator and dropped afterwards.

pub mod custody;
pub mod types;

pub use custody::{FileCustody, WalletCustody};
pub use types::{SigningWallet, WalletEntry, WalletRecord, WalletRegistry};
