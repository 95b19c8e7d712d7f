pub mod camera;
pub mod config;
pub mod context;
pub mod convert;
pub mod credentials;
pub mod fetcher;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod poller;
pub mod sampler;
pub mod scoring;
pub mod session;
pub mod sink;
pub mod task;

mod error;
#[cfg(test)]
mod testing;

pub use error::{Error, Result};
