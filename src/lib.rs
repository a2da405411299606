// Main library file for the hotel rate loader

// Core: token provider, worker pool and per-request coordination
pub mod coordinator;
pub mod pool;
pub mod service;
pub mod token;

// Shared model, errors and configuration
pub mod config;
pub mod error;
pub mod types;

// Collaborators at the vendor boundary
pub mod archive;
pub mod mock_vendor;
pub mod vendor;

// Re-export key types for convenience
pub use config::{Config, PoolConfig, RetryConfig, ShutdownPolicy, TokenConfig};
pub use coordinator::{LoadPhase, RateLoader};
pub use error::{AuthError, ConfigError, LoadError, RateFailure, VendorError};
pub use pool::{PoolStatsSnapshot, WorkerPool};
pub use service::RateService;
pub use token::{TokenClient, TokenProvider};
pub use types::{LoadRatesRequest, RateInfo, RateQuery, RateRequest, RateResult, RateSet, StayDates, Token};
pub use vendor::{Authenticator, RateFetcher};
