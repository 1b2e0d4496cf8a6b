pub mod async_runtime;
mod time;
pub mod types;

pub use time::*;

pub static METRIC_NAME_LABEL: &str = "__name__";
pub static BUCKET_LABEL: &str = "le";
