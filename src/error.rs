use bson::document::ValueAccessError;
use bson::Timestamp;
use mongodb::error::{Error as MongoError, ErrorKind};
use std::result::Result as StdResult;
use thiserror::Error;
use uuid::Uuid;

/// Every failure the tenant cloner can report.
#[derive(Error, Debug)]
pub enum CloneError {
    #[error("Mongodb connection error")]
    MongoError(#[from] MongoError),
    #[error("Unexpected server reply")]
    BsonError(#[from] ValueAccessError),
    #[error("Invalid configuration file")]
    ConfigError(#[from] toml::de::Error),
    #[error("Read configuration failed")]
    IoError(#[from] std::io::Error),
    #[error("Check permission for database {db:?} failed, connection string: {uri:?}, detailed: {detail:?}")]
    PermissionError {
        uri: String,
        db: String,
        detail: MongoError,
    },
    #[error("Namespace {ns} not found on the donor")]
    NamespaceNotFound { ns: String },
    #[error("Namespace {ns} already exists: {detail}")]
    NamespaceExists { ns: String, detail: String },
    #[error("Collection uuid {uuid} already exists as {ns} but does not belong to tenant {tenant_id}")]
    NotOwnedByTenant {
        uuid: Uuid,
        ns: String,
        tenant_id: String,
    },
    #[error("Collection uuid {uuid} already exists as {ns} but does not belong to database {expected_db}")]
    DatabaseMismatch {
        uuid: Uuid,
        ns: String,
        expected_db: String,
    },
    #[error("Illegal operation: {0}")]
    IllegalOperation(String),
    #[error("Invalid namespace: {0}")]
    InvalidNamespace(String),
    #[error("Donor reply carries no operation time")]
    MissingOperationTime,
    #[error("Failed to get listIndexes result majority-committed at {ts:?}")]
    MajorityWaitFailed {
        ts: Timestamp,
        #[source]
        source: Box<CloneError>,
    },
    #[error("Create indexes on {ns} failed")]
    IndexBuildFailed {
        ns: String,
        #[source]
        source: Box<CloneError>,
    },
    #[error("Insert documents into {ns} failed: {failure}")]
    InsertFailed { ns: String, failure: WriteFailure },
    #[error("Database work scheduler is shut down")]
    SchedulerShutdown,
    #[error("Cloner was asked to exit")]
    Cancelled,
    #[error("Tenant collection cloner stage {stage} failed, namespace: {ns}, tenant: {tenant_id}")]
    Stage {
        stage: &'static str,
        ns: String,
        tenant_id: String,
        #[source]
        source: Box<CloneError>,
    },
}

impl CloneError {
    /// Is this the "collection dropped on the donor" signal?
    ///
    /// Only a [SourceReader](crate::SourceReader) raises it.  A raw driver error with the same
    /// server code comes from the recipient and stays fatal.
    pub fn is_namespace_not_found(&self) -> bool {
        matches!(self, CloneError::NamespaceNotFound { .. })
    }

    /// Wrap a stage local error with stage identifying context.
    pub fn in_stage(self, stage: &'static str, ns: &str, tenant_id: &str) -> CloneError {
        CloneError::Stage {
            stage,
            ns: ns.to_string(),
            tenant_id: tenant_id.to_string(),
            source: Box::new(self),
        }
    }
}

/// One document which an ordered insert refused.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("write error at index {index}, code {code}: {message}")]
pub struct WriteFailure {
    /// position of the document inside the inserted batch.
    pub index: usize,
    /// server error code.
    pub code: i32,
    /// server error message.
    pub message: String,
}

/// error code of a server side command failure, if `error` is one.
pub(crate) fn command_error_code(error: &MongoError) -> Option<i32> {
    match error.kind.as_ref() {
        ErrorKind::Command(err) => Some(err.code),
        _ => None,
    }
}

/// tenant cloner result.
pub type Result<T> = StdResult<T, CloneError>;
