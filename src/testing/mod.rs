//! Testing utilities and mock implementations
//!
//! Provides mock implementations for exercising the transport connections
//! without a live hub or broker.

pub mod mocks;

pub use mocks::*;
