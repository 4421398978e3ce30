//! Throttled, authenticated API requests.
//!
//! [`RequestPipeline`] sends requests to the API base with the session's
//! headers attached, spaced out by a [`Throttle`], and retries once with
//! fresh headers when the service answers 401 or 403.

mod error;
mod pipeline;
mod throttle;

pub use error::{MAX_ERROR_BODY_BYTES, RequestError};
pub use pipeline::{API_PATH, RequestPipeline};
pub use throttle::{RateLimiter, Throttle};
