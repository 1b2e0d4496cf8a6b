pub mod backend;
pub mod cache;
pub mod common;
pub mod config;
pub mod error;
pub mod eval;
pub mod labels;
pub mod leaf;
pub mod logging;
pub mod pool;
pub mod query;
pub(crate) mod series;

pub use backend::{IndexShards, LogGroupFilters, SearchBackend, ShardSearchRequest};
pub use config::{get_global_settings, EngineSettings};
pub use error::{EngineError, EngineResult, ErrorType};
pub use query::{QueryData, QueryEngine, QueryRequest};
