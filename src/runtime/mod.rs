mod acknowledged_message;
mod worker_handle;

use std::future::Future;

pub(crate) use acknowledged_message::{
    AcknowledgedMessage,
    AcknowledgmentReceiver,
    AcknowledgmentSender,
};
pub(crate) use worker_handle::{WorkerHandle, WorkerHandleListener};

/// Spawn a task in the background to run a future.
pub(crate) fn spawn<F, O>(fut: F) -> tokio::task::JoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    tokio::task::spawn(fut)
}
