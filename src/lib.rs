//! Warden - Distributed Rate Limiting with Graceful Degradation
//!
//! This crate implements fixed-window admission control shared across many
//! server processes through Redis. When the shared store becomes unavailable
//! each process keeps enforcing limits with a local in-memory counter, or
//! applies a per-limit fail-open/fail-closed policy, instead of blocking or
//! silently dropping protection.

pub mod config;
pub mod error;
pub mod ratelimit;
