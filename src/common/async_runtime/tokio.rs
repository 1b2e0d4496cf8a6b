use std::sync::LazyLock;
use tokio::runtime::Runtime;

pub static TOKIO_RUNTIME: LazyLock<Runtime> = LazyLock::new(create_runtime);

pub fn init_runtime() {
    let _ = &TOKIO_RUNTIME;
}

fn create_runtime() -> Runtime {
    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .thread_name("promql-docstore")
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        // without a runtime nothing in the engine can run
        Err(e) => panic!("failed to build tokio runtime: {e}"),
    }
}
