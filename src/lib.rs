//! GPU telemetry sampling with bounded, non-blocking fan-out to a terminal
//! view and WebSocket clients.

pub mod channel;
pub mod collectors;
pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod pipeline;
pub mod registry;
pub mod renderer;
pub mod sampler;
pub mod snapshot;
