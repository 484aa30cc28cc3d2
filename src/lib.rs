pub mod classify;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod retry;
pub mod transport;

// Recon
pub mod branches;
pub mod hierarchy;
pub mod identity;
pub mod runners;
pub mod secrets;

// Attack
pub mod ppe;

pub mod report;
