//! Testing utilities and mock implementations
//!
//! Test doubles for the broker transport, the signal handler and the
//! registry command API.

pub mod mocks;

pub use mocks::*;
