//! Funding: opening obligations backed by a deposit address

pub mod service;

pub use service::{FundingRequest, FundingService};
