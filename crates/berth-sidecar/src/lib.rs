//! Typed client for the sidecar agent API.
//!
//! The sidecar is the HTTP service embedded in every sandbox image,
//! reachable on the provider's mapped port. All requests carry the
//! session's shared secret as a bearer token; streaming endpoints are
//! consumed as SSE. Dropping a response mid-stream propagates cancellation
//! to the sidecar.

mod client;
mod sse;
mod types;

pub use client::{ChatStream, SidecarClient};
pub use sse::{SseEvent, SseParser};
pub use types::*;
