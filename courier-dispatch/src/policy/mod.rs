//! Policy abstractions for dispatch operations.
//!
//! Admission and protection decisions live here, separate from the
//! dispatcher's orchestration loop, so each policy can be exercised on its
//! own and the loop stays a thin driver.
//!
//! ## Policies
//!
//! - [`DispatchPipeline`]: composes the rate limiter and circuit breaker
//!   checks around one send attempt

pub mod pipeline;

pub use pipeline::DispatchPipeline;
