//! # mushaf-sync
//!
//! Async runtime around [`mushaf_engine`]: local persistence, the
//! reconciliation pass and the scheduler that decides when it runs.
//!
//! ## Pieces
//!
//! - [`store::LocalStore`]: the ledger's persistent home, with
//!   [`SqliteStore`] and [`MemoryStore`] implementations
//! - [`RemoteApi`] and [`TokenProvider`]: the server and its credentials,
//!   supplied by the host application
//! - [`Synchronizer`]: runs one pass over every entity type
//! - [`SchedulerHandle`]: runs passes in response to [`Trigger`]s
//!
//! ## Wiring
//!
//! ```ignore
//! let config = SyncConfig::from_env()?;
//! let store = Arc::new(SqliteStore::open(&config.database_url).await?);
//! let sync = Synchronizer::new(store, remote, tokens);
//! let scheduler = SchedulerHandle::spawn(config.scheduler, Arc::new(sync));
//! scheduler.apply(Trigger::AppStart).await?;
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod pass;
pub mod remote;
pub mod scheduler;
pub mod store;
pub mod telemetry;

pub use auth::{AccessToken, AuthError, StaticTokenProvider, TokenProvider};
pub use config::{ConfigError, SchedulerConfig, SyncConfig};
pub use error::{Result, SyncError};
pub use pass::{EntityReport, PassReport, Synchronizer};
pub use remote::{Delta, RemoteApi, RemoteError};
pub use scheduler::{SchedulerHandle, SchedulerState, SchedulerStatus, SyncTask, Trigger};
pub use store::{LocalStore, MemoryStore, SqliteStore};
