//! Background inventory sync for every connected integration.
//!
//! ```text
//! integrations table (shared SQLite file)
//!          ↓  discovery cycle
//! ┌─────────────────────────────────────────┐
//! │       SyncWorkerManager                  │
//! │  - one scheduler per integration         │
//! │  - stop on disconnect, restart on error  │
//! └─────────────────────────────────────────┘
//!          ↓  every run interval
//! ┌─────────────────────────────────────────┐
//! │       SyncScheduler                      │
//! │  - refresh OAuth token when near expiry  │
//! │  - run an inventory sync job             │
//! └─────────────────────────────────────────┘
//! ```
//!
//! Jobs started here land in the same `sync_jobs` table the HTTP server
//! reads, so sellers can watch and cancel them from the API.

pub mod manager;
pub mod scheduler;

pub use manager::{DiscoveryReport, SyncWorkerManager, WorkerSettings};
pub use scheduler::{SchedulerStatus, SyncScheduler};
