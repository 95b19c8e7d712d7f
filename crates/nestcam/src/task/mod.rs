use std::time::Duration;

use tokio_util::sync::CancellationToken;

mod batch;
mod live;
pub mod pipeline;

pub use batch::*;
pub use live::*;

/// Where a driver is in its lifecycle. Transitions are logged at debug level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Init,
    Authenticated,
    Polling,
    Processing,
    ShuttingDown,
    Terminated,
}

/// Sleeps for `duration`. Returns false if cancelled first.
async fn pause(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
