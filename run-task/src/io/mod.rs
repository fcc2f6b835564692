//! Side-effecting stages: probing, privilege switches, caches, checkouts,
//! secrets and process supervision.

pub mod cache;
pub mod checkout;
pub mod config;
pub mod privilege;
pub mod probe;
pub mod process;
pub mod secrets;
pub mod supervisor;
pub mod vcs;
