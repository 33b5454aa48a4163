//! Relaypanel - provisions proxy inbounds for a managed xray process
//!
//! This library provides:
//! - Idempotent inbound provisioning keyed by remark, with random port
//!   allocation and client identity assignment
//! - Share-link rendering for provisioned inbounds
//! - A debounced restart coordinator that collapses many configuration
//!   changes into at most one xray restart per tick
//! - A SQLite store and an HTTP API in front of all of it

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod identity;
pub mod link;
pub mod provision;
pub mod restart;
pub mod settings;
pub mod xray;
