//! Guardian - Request Admission Control
//!
//! This crate decides whether a caller's request may proceed, based on two
//! per-token quotas that reset on a fixed cycle: a request count and a
//! request volume in bytes. Counters live in a pluggable store, either in
//! process or in Redis so that several instances can share them.

pub mod config;
pub mod error;
pub mod grpc;
pub mod quota;
pub mod scheduler;
pub mod store;
