//! Log processing for kubestream
//!
//! This crate turns raw session parameters into an immutable tailing
//! configuration and runs the engine that follows matching containers.

mod config;
mod engine;
mod filter;
mod parser;

pub use config::{DEFAULT_MAX_LOG_REQUESTS, DEFAULT_SINCE, TailConfig};
pub use engine::{EngineError, KubeTailer, LogTarget, TailEngine};
pub use filter::{CompiledFilters, FilterError, LabelSelector, PatternList};
pub use parser::LogParser;

// Re-export types used in our public API
pub use kubestream_types::{ContainerState, LogRecord, NamespaceScope, SessionParams};
