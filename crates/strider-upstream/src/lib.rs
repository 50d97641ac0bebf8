pub mod client;
pub mod mock;
pub mod wire;

pub use client::{UpstreamClient, UpstreamConfig};
pub use mock::MockLocationService;
