pub mod cache;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod gc;
pub mod index;
pub mod metrics;
pub mod models;
pub mod persistence;
pub mod store;
pub mod tokenizer;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{GcConfig, RetentionProfile, StoreSettings, TokenizerConfig, TypeWeights};
pub use engine::{ContextEngine, ContextEngineBuilder};
pub use error::{ContextError, ErrorKind, Result};
pub use metrics::ContextMetrics;
pub use models::*;
pub use tokenizer::{ApproxTokenCounter, CachedTokenCounter, TokenCounter, Tokenizer};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
