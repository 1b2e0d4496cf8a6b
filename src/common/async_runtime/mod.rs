mod tokio;

use std::future::Future;
pub use self::tokio::{init_runtime, TOKIO_RUNTIME};
pub use ::tokio::task::JoinHandle;

/// Runs a future to completion on the shared runtime. Must not be called from within it.
pub fn block_on<F: Future>(future: F) -> F::Output {
    TOKIO_RUNTIME.block_on(future)
}

pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    TOKIO_RUNTIME.spawn(future)
}
