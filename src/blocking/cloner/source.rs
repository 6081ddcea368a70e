//! Reading from the donor.

use bson::{doc, Bson, Document, Timestamp};
use mongodb::error::Error as MongoError;
use mongodb::sync::{Client, Database};
use std::sync::Mutex;
use tracing::{debug, warn};

use super::bson_helper::{self, get_number, take_documents};
use super::options::{IndexSpec, SourceCollection};
use crate::error::{command_error_code, CloneError, Result};
use crate::{Namespace, ADMIN_DB_NAME, ID_KEY, NAMESPACE_NOT_FOUND_CODE};

/// Pull based sequence of network batches.  The next batch is only requested when the
/// consumer asks for it.
pub type BatchStream<'a> = Box<dyn Iterator<Item = Result<Vec<Document>>> + 'a>;

/// A find against the donor, always at majority read concern.
#[derive(Debug, Clone, PartialEq)]
pub struct FindQuery {
    /// query filter.
    pub filter: Document,
    /// fields to return, all of them when `None`.
    pub projection: Option<Document>,
    /// sort order.
    pub sort: Option<Document>,
    /// index hint.
    pub hint: Option<Document>,
    /// documents per network batch, server default when 0.
    pub batch_size: u32,
}

impl FindQuery {
    /// find every document matching `filter`.
    pub fn new(filter: Document) -> Self {
        FindQuery {
            filter,
            projection: None,
            sort: None,
            hint: None,
            batch_size: 0,
        }
    }

    /// Walk the `_id` index in ascending order, it gives a well defined resume point.
    pub fn by_id(filter: Document, batch_size: u32) -> Self {
        FindQuery {
            filter,
            projection: None,
            sort: Some(doc! {ID_KEY: 1}),
            hint: Some(doc! {ID_KEY: 1}),
            batch_size,
        }
    }
}

/// Queries the cloner issues against the donor.
///
/// A collection dropped on the donor must surface as [CloneError::NamespaceNotFound].
pub trait SourceReader: Send + Sync {
    /// count documents matching `filter`, at majority read concern.  May be negative after an
    /// unclean donor shutdown.
    fn count(&self, source: &SourceCollection, filter: Document) -> Result<i64>;

    /// first document matching `filter`, at majority read concern.
    fn find_one(
        &self,
        source: &SourceCollection,
        filter: Document,
        projection: Option<Document>,
    ) -> Result<Option<Document>>;

    /// every index spec of the collection.
    fn list_indexes(&self, source: &SourceCollection) -> Result<Vec<IndexSpec>>;

    /// open a cursor, batches are fetched lazily while the stream is consumed.
    fn streaming_find<'a>(
        &'a self,
        source: &SourceCollection,
        query: FindQuery,
    ) -> Result<BatchStream<'a>>;

    /// operation time the donor attached to its latest reply.
    fn last_operation_time(&self) -> Option<Timestamp>;

    /// block until `ts` is majority committed on the donor.
    fn wait_until_majority_committed(&self, ts: Timestamp) -> Result<()>;
}

/// [SourceReader] over a direct connection to one donor node.
///
/// Every command addresses the collection by uuid.
pub struct MongoSourceReader {
    client: Client,
    operation_time: Mutex<Option<Timestamp>>,
}

impl MongoSourceReader {
    /// create a reader on donor `client`, which should be a direct connection.
    pub fn new(client: Client) -> Self {
        MongoSourceReader {
            client,
            operation_time: Mutex::new(None),
        }
    }

    fn run_command(&self, db: &Database, cmd: Document, source: &SourceCollection) -> Result<Document> {
        let reply = db
            .run_command(cmd, None)
            .map_err(|e| classify_error(e, source))?;
        if let Ok(ts) = reply.get_timestamp("operationTime") {
            if let Ok(mut guard) = self.operation_time.lock() {
                *guard = Some(ts);
            }
        }
        Ok(reply)
    }

    fn open_cursor<'a>(&'a self, source: &SourceCollection, cmd: Document, batch_size: u32) -> Result<CursorBatches<'a>> {
        let db = self.client.database(source.db());
        let mut reply = self.run_command(&db, cmd, source)?;
        let cursor = reply.get_document_mut("cursor")?;
        let cursor_id = get_number(cursor, "id")?;
        let coll_name = Namespace::parse(cursor.get_str("ns")?)?.coll().to_string();
        let first_batch = take_documents(cursor, "firstBatch")?;
        Ok(CursorBatches {
            reader: self,
            db,
            source: source.clone(),
            coll_name,
            cursor_id,
            batch_size,
            pending: Some(first_batch),
        })
    }
}

fn majority() -> Document {
    doc! {"level": "majority"}
}

fn classify_error(err: MongoError, source: &SourceCollection) -> CloneError {
    if command_error_code(&err) == Some(NAMESPACE_NOT_FOUND_CODE) {
        CloneError::NamespaceNotFound {
            ns: format!("{}.{}", source.db(), source.uuid()),
        }
    } else {
        CloneError::MongoError(err)
    }
}

impl SourceReader for MongoSourceReader {
    fn count(&self, source: &SourceCollection, filter: Document) -> Result<i64> {
        let db = self.client.database(source.db());
        let reply = self.run_command(
            &db,
            doc! {
                "count": bson_helper::new_bson_binary(source.uuid()),
                "query": filter,
                "readConcern": majority(),
            },
            source,
        )?;
        Ok(get_number(&reply, "n")?)
    }

    fn find_one(
        &self,
        source: &SourceCollection,
        filter: Document,
        projection: Option<Document>,
    ) -> Result<Option<Document>> {
        let mut cmd = doc! {
            "find": bson_helper::new_bson_binary(source.uuid()),
            "filter": filter,
            "limit": 1_i64,
            "singleBatch": true,
            "readConcern": majority(),
        };
        if let Some(projection) = projection {
            cmd.insert("projection", projection);
        }
        let mut batches = self.open_cursor(source, cmd, 0)?;
        match batches.next() {
            Some(batch) => Ok(batch?.into_iter().next()),
            None => Ok(None),
        }
    }

    fn list_indexes(&self, source: &SourceCollection) -> Result<Vec<IndexSpec>> {
        let cmd = doc! {"listIndexes": bson_helper::new_bson_binary(source.uuid())};
        let mut specs = vec![];
        for batch in self.open_cursor(source, cmd, 0)? {
            specs.extend(batch?.into_iter().map(IndexSpec::new));
        }
        Ok(specs)
    }

    fn streaming_find<'a>(
        &'a self,
        source: &SourceCollection,
        query: FindQuery,
    ) -> Result<BatchStream<'a>> {
        let mut cmd = doc! {
            "find": bson_helper::new_bson_binary(source.uuid()),
            "filter": query.filter,
            "noCursorTimeout": true,
            "readConcern": majority(),
        };
        if let Some(projection) = query.projection {
            cmd.insert("projection", projection);
        }
        if let Some(sort) = query.sort {
            cmd.insert("sort", sort);
        }
        if let Some(hint) = query.hint {
            cmd.insert("hint", hint);
        }
        if query.batch_size > 0 {
            cmd.insert("batchSize", query.batch_size as i64);
        }
        let batches = self.open_cursor(source, cmd, query.batch_size)?;
        Ok(Box::new(batches))
    }

    fn last_operation_time(&self) -> Option<Timestamp> {
        self.operation_time.lock().ok().and_then(|guard| *guard)
    }

    fn wait_until_majority_committed(&self, ts: Timestamp) -> Result<()> {
        // any majority read after `ts` only returns once `ts` is majority committed.
        self.client.database(ADMIN_DB_NAME).run_command(
            doc! {
                "find": "system.version",
                "filter": {},
                "limit": 1_i64,
                "singleBatch": true,
                "readConcern": {"level": "majority", "afterClusterTime": ts},
            },
            None,
        )?;
        Ok(())
    }
}

/// An open donor cursor, continued with `getMore` on demand.
struct CursorBatches<'a> {
    reader: &'a MongoSourceReader,
    db: Database,
    source: SourceCollection,
    coll_name: String,
    cursor_id: i64,
    batch_size: u32,
    pending: Option<Vec<Document>>,
}

impl CursorBatches<'_> {
    fn get_more(&mut self) -> Result<Vec<Document>> {
        let mut cmd = doc! {
            "getMore": Bson::Int64(self.cursor_id),
            "collection": self.coll_name.as_str(),
        };
        if self.batch_size > 0 {
            cmd.insert("batchSize", self.batch_size as i64);
        }
        let mut reply = self.reader.run_command(&self.db, cmd, &self.source)?;
        let cursor = reply.get_document_mut("cursor")?;
        self.cursor_id = get_number(cursor, "id")?;
        Ok(take_documents(cursor, "nextBatch")?)
    }
}

impl Iterator for CursorBatches<'_> {
    type Item = Result<Vec<Document>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(batch) = self.pending.take() {
                if !batch.is_empty() {
                    debug!(size = batch.len(), coll = %self.coll_name, "Received batch from donor.");
                    return Some(Ok(batch));
                }
            }
            if self.cursor_id == 0 {
                return None;
            }
            match self.get_more() {
                Ok(batch) => self.pending = Some(batch),
                Err(e) => {
                    // a failed getMore leaves nothing to kill.
                    self.cursor_id = 0;
                    return Some(Err(e));
                }
            }
        }
    }
}

impl Drop for CursorBatches<'_> {
    fn drop(&mut self) {
        if self.cursor_id == 0 {
            return;
        }
        let result = self.db.run_command(
            doc! {
                "killCursors": self.coll_name.as_str(),
                "cursors": [Bson::Int64(self.cursor_id)],
            },
            None,
        );
        if let Err(err) = result {
            warn!(?err, cursor_id = self.cursor_id, "Failed to kill donor cursor.");
        }
    }
}
