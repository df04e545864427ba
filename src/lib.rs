//! Batchgate - Dynamic Batching Inference Gateway
//!
//! A front-end service that accepts concurrent text-generation requests,
//! groups them into GPU-friendly batches, and executes them against an
//! upstream OpenAI-compatible engine or a deterministic mock.

pub mod auth;
pub mod batcher;
pub mod cli;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod middleware;
pub mod queue;
pub mod server;
pub mod settings;
pub mod stats;
pub mod task;
pub mod telemetry;

pub use engine::EngineAdapter;
