//! Hardware-independent core of the ridelog telemetry logger.
//!
//! This crate holds the device mode state machine and the on-card logging
//! pipeline: the capture queue fed by the timer interrupt, the logging
//! engine that drains it, and the session directory manager that owns the
//! card layout. Peripherals are reached through the traits in [`sensors`]
//! and [`storage::StorageVolume`].
//!
//! It is `#![no_std]` without an allocator so it runs on the logger's
//! microcontroller, and builds with `std` only for host tests.

#![cfg_attr(not(test), no_std)]

pub mod app_state;
pub mod capture;
pub mod config;
pub mod engine;
pub mod sensors;
pub mod storage;
