//! Testing utilities and mock implementations
//!
//! Mock protocol engine implementing the capability traits in
//! [`crate::engine`], so lifecycle, send, and refresh logic can be tested
//! without a broker.

pub mod mocks;

pub use mocks::*;
