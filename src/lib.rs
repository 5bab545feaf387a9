//! # Rover Link
//!
//! Ground-control link manager for ArduPilot rovers.
//!
//! This library provides the core functionality for supervising one MAVLink
//! link per vehicle: connection lifecycle and heartbeat health tracking,
//! telemetry aggregation into bounded-history snapshots, and a safety-gated
//! RC-override controller with watchdogs and emergency-stop semantics.

pub mod config;
pub mod connection;
pub mod controller;
pub mod error;
pub mod modes;
pub mod telemetry;
pub mod transport;

/// Lock a mutex, recovering the guard if a panicking holder poisoned it.
/// Link state must stay reachable for teardown even after a fault.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
