//! Control-plane HTTP client.
//!
//! [`HttpTransport`] is the shared low-level sender (backoff retries, error
//! classification). [`RefreshClient`] implements the credential manager's
//! refresh seam on top of it, and [`ApiClient`] adds bearer auth with the
//! 401 refresh-and-retry logic and its circuit breaker.

mod client;
mod endpoints;

pub use client::{ApiClient, HttpTransport, RefreshClient};
pub use endpoints::{AuthMode, Endpoint};
