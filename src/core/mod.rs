//! Core domain types: requests, payloads, constraints and policies.

pub mod backoff;
pub mod chain;
pub mod clock;
pub mod constraints;
pub mod data;
pub mod merger;
pub mod request;
pub mod state;
pub mod types;
