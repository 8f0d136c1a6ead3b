//! Test support utilities for dispatcher integration tests
//!
//! This module provides a scriptable transport double so tests can drive
//! the full enqueue-to-delivery flow without a real provider endpoint.

pub mod mock_transport;

pub use mock_transport::MockTransport;
