#![deny(missing_docs)]
//! A concurrent, file-backed store for exam average predictions.
//!
//! The store keeps three JSON collections, `users`, `guesses` and `results`, each persisted as
//! one JSON object file in a data directory. It provides the [`Service`] itself, as well as a
//! [`predstore-client`] and [`predstore-server`] executable that can be used to interact with it.
//! Requests are sent between the client and server using synchronous networking over a
//! custom protocol.
//!
//! ## Supported Operations
//! - `GET` a whole collection, served from a write-through cache
//! - `PUT` a partial update, shallow-merged into a collection and persisted atomically
//! - `BACKUP` and `EXPORT`, queued on a supervised background pool
//! - `CLEAR-ALL`, `RESTART` and `RESTORE`, which always snapshot the data before replacing it
//! - `STATS`, `WINNERS`, `SNAPSHOTS` and `HEALTH` reports
//!
//! Every operation except `HEALTH` is admitted by a sliding-window [`RateLimiter`] keyed by
//! client and [`OperationClass`].
//!
//! ## CacheStore
//! [`CacheStore`] sits in front of a [`Persistence`] implementation (by default the
//! [`FileStore`]). A cached collection is reused as long as its freshness [`Marker`] (the
//! modification time of its file) hasn't moved past the one recorded when it was cached. Writes
//! reach the disk before the cache, and a failed write leaves the cache untouched.
//!
//! ## Snapshots
//! The [`BackupManager`] writes each [`Snapshot`] both as plain and as gzip compressed JSON,
//! named after a strictly increasing [`SnapshotId`], and rotates away all but the newest ones.
//!
//! ## Custom Protocol
//! A [`Request`] is encoded to a JSON string and sent over a TcpStream. The server answers with
//! an "Ok" [`Response`] holding a JSON value, an "Err" response with a description of the error,
//! or a "RateLimited" response if the caller exceeded its quota.
//!
//! [`predstore-server`]: ./predstore-server.rs
//! [`predstore-client`]: ./predstore-client.rs

pub use analysis::{AnalysisRow, CourseNames, Stats, Winners};
pub use backup::{BackupManager, Snapshot, SnapshotId};
pub use cache::{CacheStore, LockedCache};
pub use client::PredictionClient;
pub use collection::{Collection, CollectionName};
pub use command::{Request, Response};
pub use config::StoreConfig;
pub use engine::{FileStore, Marker, Persistence};
pub use error::{Result, StoreError};
pub use export::{ExportPaths, Exporter};
pub use rate_limit::{Limiters, OperationClass, Quota, RateLimiter};
pub use server::{PredictionServer, StopHandle};
pub use service::{Health, Service};
pub use thread_pool::{RayonThreadPool, SharedQueueThreadPool, TaskId, ThreadPool};

pub mod analysis;
pub mod backup;
pub mod cache;
mod client;
pub mod collection;
mod command;
pub mod config;
pub mod engine;
mod error;
pub mod export;
pub mod rate_limit;
mod server;
mod service;
pub mod thread_pool;
