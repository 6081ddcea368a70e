#[doc(hidden)]
pub mod bson_helper;
mod collection_cloner;
#[doc(hidden)]
pub mod mongo_helper;
mod options;
pub mod scheduler;
mod shared_data;
pub mod source;
pub mod stage;
mod stats;
pub mod storage;

pub use collection_cloner::{ClonerContext, ClonerOptions, CollectionCloner};
pub use options::{AutoIndexId, CollectionOptions, IndexSpec, SourceCollection};
pub use scheduler::{OrderedScheduler, WorkScheduler};
pub use shared_data::MigrationSharedData;
pub use source::{MongoSourceReader, SourceReader};
pub use stage::CloneOutcome;
pub use stats::{ClonerStats, ProgressMeter};
pub use storage::{LocalStorage, MongoLocalStorage};
