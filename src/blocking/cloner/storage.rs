//! Writing to the recipient.

use bson::{doc, Bson, Document};
use mongodb::error::ErrorKind;
use mongodb::options::{FindOneOptions, InsertManyOptions};
use mongodb::sync::Client;
use std::result::Result as StdResult;
use uuid::Uuid;

use super::bson_helper;
use super::mongo_helper;
use super::options::{CollectionOptions, IndexSpec};
use crate::error::{command_error_code, CloneError, Result, WriteFailure};
use crate::{Namespace, ADMIN_DB_NAME, ID_KEY, NAMESPACE_EXISTS_CODE};

/// Outcome of every attempted document of an ordered insert.  The sequence stops at the
/// first failed document.
pub type InsertResults = Vec<StdResult<(), WriteFailure>>;

/// Recipient side storage primitives the cloner needs.
pub trait LocalStorage: Send + Sync {
    /// Create collection `ns` with `options`, keeping the donor's uuid.
    ///
    /// Fails with [CloneError::NamespaceExists] when `ns` already exists.
    fn create_collection(&self, ns: &Namespace, options: &CollectionOptions) -> Result<()>;

    /// build `specs` on collection `ns`, which is expected to be empty.
    fn create_indexes_on_empty_collection(&self, ns: &Namespace, specs: &[IndexSpec]) -> Result<()>;

    /// namespace of the local collection with `uuid`, if any.
    fn lookup_by_uuid(&self, uuid: Uuid) -> Result<Option<Namespace>>;

    /// Ordered insert of `docs`, skipping document validation: the documents were already
    /// validated on the donor.
    fn insert_ordered(&self, ns: &Namespace, docs: Vec<Document>) -> Result<InsertResults>;

    /// largest `_id` present in `ns`.
    fn find_last_id(&self, ns: &Namespace) -> Result<Option<Bson>>;

    /// number of documents in `ns`.
    fn count_documents(&self, ns: &Namespace) -> Result<u64>;

    /// names of the indexes present on `ns`.
    fn list_index_names(&self, ns: &Namespace) -> Result<Vec<String>>;
}

/// [LocalStorage] on the recipient's mongodb client.
pub struct MongoLocalStorage {
    client: Client,
}

impl MongoLocalStorage {
    /// create storage on recipient `client`.
    pub fn new(client: Client) -> Self {
        MongoLocalStorage { client }
    }
}

impl LocalStorage for MongoLocalStorage {
    fn create_collection(&self, ns: &Namespace, options: &CollectionOptions) -> Result<()> {
        // `create` can't choose the collection uuid, a `create` oplog entry applied through
        // `applyOps` can.
        let mut create = doc! {"create": ns.coll()};
        create.extend(options.as_document().clone());
        let result = self.client.database(ADMIN_DB_NAME).run_command(
            doc! {
                "applyOps": [{
                    "op": "c",
                    "ns": format!("{}.$cmd", ns.db()),
                    "ui": bson_helper::new_bson_binary(options.uuid()),
                    "o": create,
                }]
            },
            None,
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if command_error_code(&e) == Some(NAMESPACE_EXISTS_CODE) => {
                Err(CloneError::NamespaceExists {
                    ns: ns.to_string(),
                    detail: e.to_string(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn create_indexes_on_empty_collection(&self, ns: &Namespace, specs: &[IndexSpec]) -> Result<()> {
        if specs.is_empty() {
            return Ok(());
        }
        let indexes: Vec<Document> = specs.iter().map(|s| s.as_document().clone()).collect();
        self.client.database(ns.db()).run_command(
            doc! {
                "createIndexes": ns.coll(),
                "indexes": indexes,
            },
            None,
        )?;
        Ok(())
    }

    fn lookup_by_uuid(&self, uuid: Uuid) -> Result<Option<Namespace>> {
        mongo_helper::find_collection_by_uuid(&self.client, uuid)
    }

    fn insert_ordered(&self, ns: &Namespace, docs: Vec<Document>) -> Result<InsertResults> {
        let total = docs.len();
        let coll = self
            .client
            .database(ns.db())
            .collection::<Document>(ns.coll());
        let options = InsertManyOptions::builder()
            .ordered(true)
            .bypass_document_validation(true)
            .build();
        let err = match coll.insert_many(docs, options) {
            Ok(_) => return Ok(vec![Ok(()); total]),
            Err(err) => err,
        };
        let first_failure = match err.kind.as_ref() {
            ErrorKind::BulkWrite(failure) => failure
                .write_errors
                .as_ref()
                .and_then(|errors| errors.iter().min_by_key(|e| e.index))
                .map(|e| WriteFailure {
                    index: e.index,
                    code: e.code,
                    message: e.message.clone(),
                }),
            _ => None,
        };
        match first_failure {
            Some(failure) => {
                let mut results: InsertResults = vec![Ok(()); failure.index];
                results.push(Err(failure));
                Ok(results)
            }
            None => Err(err.into()),
        }
    }

    fn find_last_id(&self, ns: &Namespace) -> Result<Option<Bson>> {
        let coll = self
            .client
            .database(ns.db())
            .collection::<Document>(ns.coll());
        let last = coll.find_one(
            None,
            FindOneOptions::builder()
                .sort(doc! {ID_KEY: -1})
                .projection(doc! {ID_KEY: 1})
                .build(),
        )?;
        Ok(last.and_then(|mut d| d.remove(ID_KEY)))
    }

    fn count_documents(&self, ns: &Namespace) -> Result<u64> {
        let coll = self
            .client
            .database(ns.db())
            .collection::<Document>(ns.coll());
        Ok(coll.count_documents(None, None)?)
    }

    fn list_index_names(&self, ns: &Namespace) -> Result<Vec<String>> {
        let specs = mongo_helper::run_cursor_command(
            &self.client.database(ns.db()),
            doc! {"listIndexes": ns.coll()},
        )?;
        Ok(specs
            .into_iter()
            .map(|spec| IndexSpec::new(spec).name().to_string())
            .collect())
    }
}
