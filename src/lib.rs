//! Tenant cloner lib, which copies a live tenant collection (documents and index definitions)
//! from a donor replica set to a recipient, resumably.
//!
//! The heart of the crate is [CollectionCloner], a staged pipeline:
//! count -> check donor emptiness -> list indexes -> create collection -> query and insert.
//!
//! The cloner talks to the outside world through three seams:
//! [SourceReader] (queries against the donor), [LocalStorage] (the recipient) and
//! [WorkScheduler] (runs local inserts off the reading thread).  [MongoSourceReader],
//! [MongoLocalStorage] and [OrderedScheduler] are the mongodb backed implementations.
//!
//! # CollectionCloner example:
//! ```no_run
//! use std::sync::Arc;
//! use tenant_cloner::{
//!     ClonerContext, ClonerOptions, CollectionCloner, Connection, MigrationSharedData,
//!     MongoLocalStorage, MongoSourceReader, Namespace, OrderedScheduler,
//! };
//! use tenant_cloner::blocking::cloner::mongo_helper;
//!
//! let conn = Connection::new("mongodb://localhost:27017", "mongodb://localhost:27018").unwrap();
//! let ctx = ClonerContext {
//!     shared_data: Arc::new(MigrationSharedData::new(false)),
//!     reader: Arc::new(MongoSourceReader::new(conn.source_client())),
//!     storage: Arc::new(MongoLocalStorage::new(conn.target_client())),
//!     scheduler: Arc::new(OrderedScheduler::new().unwrap()),
//! };
//! for (ns, options) in mongo_helper::list_source_collections(&conn.source_db("tenantA_db")).unwrap() {
//!     let mut cloner = CollectionCloner::new(
//!         ns, options, "tenantA", "localhost:27017", ctx.clone(), ClonerOptions::default(),
//!     ).unwrap();
//!     cloner.run().unwrap();
//!     println!("{}", cloner.stats());
//! }
//! ```

#![warn(missing_docs)]

pub mod blocking;
mod config;
mod error;
mod namespace;

/// mongodb internal database for admin.
const ADMIN_DB_NAME: &str = "admin";
/// primary key field name.
const ID_KEY: &str = "_id";
/// name of the implicit primary key index.
const ID_INDEX_NAME: &str = "_id_";

/// server error code: the namespace (or collection uuid) doesn't exist.
const NAMESPACE_NOT_FOUND_CODE: i32 = 26;
/// server error code: the namespace already exists.
const NAMESPACE_EXISTS_CODE: i32 = 48;

/// documents requested per network batch when nothing else is configured.
pub const DEFAULT_BATCH_SIZE: u32 = 10000;

pub use blocking::cloner::{
    ClonerContext, ClonerOptions, ClonerStats, CloneOutcome, CollectionCloner,
    CollectionOptions, AutoIndexId, IndexSpec, LocalStorage, MigrationSharedData,
    MongoLocalStorage, MongoSourceReader, OrderedScheduler, SourceCollection, SourceReader,
    WorkScheduler,
};
pub use blocking::Connection;
pub use config::{ClonerConfig, MigrationConf};
pub use error::{CloneError, Result, WriteFailure};
pub use namespace::Namespace;
