//! In memory donor and recipient.

use bson::{doc, Bson, Document, Timestamp};
use mongodb::error::{CommandError, Error as MongoError, ErrorKind};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tenant_cloner::blocking::cloner::source::{BatchStream, FindQuery};
use tenant_cloner::blocking::cloner::storage::InsertResults;
use tenant_cloner::{
    CloneError, ClonerContext, ClonerOptions, CollectionCloner, CollectionOptions, IndexSpec,
    LocalStorage, MigrationSharedData, Namespace, OrderedScheduler, Result, SourceCollection,
    SourceReader, WriteFailure,
};
use uuid::Uuid;

pub const TENANT_ID: &str = "tenantA";
pub const DB_NAME: &str = "tenantA_db";
pub const COLL_NAME: &str = "coll";
pub const DUPLICATE_KEY_CODE: i32 = 11000;

pub fn source_nss() -> Namespace {
    Namespace::new(DB_NAME, COLL_NAME)
}

pub fn id_index() -> IndexSpec {
    IndexSpec::new(doc! {"v": 2, "key": {"_id": 1}, "name": "_id_"})
}

pub fn index(name: &str, field: &str) -> IndexSpec {
    IndexSpec::new(doc! {"v": 2, "key": {field: 1}, "name": name})
}

pub fn docs(ids: impl IntoIterator<Item = i32>) -> Vec<Document> {
    ids.into_iter().map(|i| doc! {"_id": i, "a": i * 10}).collect()
}

pub fn id_of(doc: &Document) -> i64 {
    match doc.get("_id") {
        Some(Bson::Int32(i)) => *i as i64,
        Some(Bson::Int64(i)) => *i,
        other => panic!("unexpected _id {:?}", other),
    }
}

pub fn ids(docs: &[Document]) -> Vec<i64> {
    docs.iter().map(id_of).collect()
}

/// `_id` after which a `{$expr: {$gt: ["$_id", last]}}` filter reads.
fn gt_bound(filter: &Document) -> Option<i64> {
    let expr = filter.get_document("$expr").ok()?;
    let args = expr.get_array("$gt").ok()?;
    match args.get(1)? {
        Bson::Int32(i) => Some(*i as i64),
        Bson::Int64(i) => Some(*i),
        other => panic!("unexpected resume bound {:?}", other),
    }
}

#[derive(Default)]
pub struct SourceState {
    pub docs: Vec<Document>,
    pub indexes: Vec<IndexSpec>,
    /// replaces the real count when set.
    pub count: Option<i64>,
    pub dropped: bool,
    /// the collection is dropped after this many batches were served.
    pub drop_after_batches: Option<usize>,
    pub no_operation_time: bool,
    pub fail_majority_wait: bool,
    pub calls: Vec<&'static str>,
    pub find_queries: Vec<FindQuery>,
    pub majority_waits: Vec<Timestamp>,
    /// called with the number of batches served, right after each batch.
    pub on_batch: Option<Arc<dyn Fn(usize) + Send + Sync>>,
}

/// donor holding one collection.
#[derive(Default)]
pub struct FakeSource {
    pub state: Mutex<SourceState>,
    ticks: AtomicU32,
}

impl FakeSource {
    pub fn new(docs: Vec<Document>, indexes: Vec<IndexSpec>) -> Self {
        let source = FakeSource::default();
        {
            let mut state = source.state.lock().unwrap();
            state.docs = docs;
            state.indexes = indexes;
        }
        source
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn find_queries(&self) -> Vec<FindQuery> {
        self.state.lock().unwrap().find_queries.clone()
    }

    fn enter(&self, call: &'static str) -> Result<std::sync::MutexGuard<'_, SourceState>> {
        self.ticks.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        if state.dropped {
            return Err(CloneError::NamespaceNotFound {
                ns: format!("{}.{}", DB_NAME, COLL_NAME),
            });
        }
        Ok(state)
    }
}

impl SourceReader for FakeSource {
    fn count(&self, _source: &SourceCollection, _filter: Document) -> Result<i64> {
        let state = self.enter("count")?;
        Ok(state.count.unwrap_or(state.docs.len() as i64))
    }

    fn find_one(
        &self,
        _source: &SourceCollection,
        _filter: Document,
        _projection: Option<Document>,
    ) -> Result<Option<Document>> {
        let state = self.enter("find_one")?;
        Ok(state.docs.first().map(|d| doc! {"_id": d.get("_id").unwrap().clone()}))
    }

    fn list_indexes(&self, _source: &SourceCollection) -> Result<Vec<IndexSpec>> {
        let state = self.enter("list_indexes")?;
        Ok(state.indexes.clone())
    }

    fn streaming_find<'a>(
        &'a self,
        _source: &SourceCollection,
        query: FindQuery,
    ) -> Result<BatchStream<'a>> {
        let mut state = self.enter("find")?;
        state.find_queries.push(query.clone());
        let bound = gt_bound(&query.filter);
        let mut matched: Vec<Document> = state
            .docs
            .iter()
            .filter(|d| bound.map_or(true, |b| id_of(d) > b))
            .cloned()
            .collect();
        matched.sort_by_key(id_of);
        let batch_size = if query.batch_size == 0 {
            101
        } else {
            query.batch_size as usize
        };
        let batches: Vec<Vec<Document>> = matched.chunks(batch_size).map(|c| c.to_vec()).collect();
        Ok(Box::new(FakeBatches {
            source: self,
            batches: batches.into_iter(),
            served: 0,
            drop_after: state.drop_after_batches,
            on_batch: state.on_batch.clone(),
        }))
    }

    fn last_operation_time(&self) -> Option<Timestamp> {
        if self.state.lock().unwrap().no_operation_time {
            return None;
        }
        Some(Timestamp {
            time: 100,
            increment: self.ticks.load(Ordering::SeqCst),
        })
    }

    fn wait_until_majority_committed(&self, ts: Timestamp) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.majority_waits.push(ts);
        if state.fail_majority_wait {
            return Err(CloneError::IllegalOperation("not primary".to_string()));
        }
        Ok(())
    }
}

struct FakeBatches<'a> {
    source: &'a FakeSource,
    batches: std::vec::IntoIter<Vec<Document>>,
    served: usize,
    drop_after: Option<usize>,
    on_batch: Option<Arc<dyn Fn(usize) + Send + Sync>>,
}

impl Iterator for FakeBatches<'_> {
    type Item = Result<Vec<Document>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.drop_after == Some(self.served) {
            self.source.state.lock().unwrap().dropped = true;
        }
        if let Err(e) = self.source.enter("get_more") {
            return Some(Err(e));
        }
        let batch = self.batches.next()?;
        self.served += 1;
        if let Some(on_batch) = &self.on_batch {
            on_batch(self.served);
        }
        Some(Ok(batch))
    }
}

#[derive(Debug, Clone)]
pub struct LocalCollection {
    pub uuid: Uuid,
    pub docs: Vec<Document>,
    pub index_names: Vec<String>,
}

#[derive(Default)]
pub struct StorageState {
    pub collections: HashMap<Namespace, LocalCollection>,
    pub created: Vec<Namespace>,
    pub index_builds: Vec<(Namespace, Vec<String>)>,
    /// size of every insert call, in call order.
    pub inserts: Vec<usize>,
    /// the insert call with this position (from 0) fails its first document.
    pub fail_insert_call: Option<usize>,
    /// `list_index_names` fails like a server reporting a missing namespace.
    pub list_index_names_not_found: bool,
}

/// recipient storage.
#[derive(Default)]
pub struct FakeStorage {
    pub state: Mutex<StorageState>,
}

impl FakeStorage {
    pub fn with_collection(ns: Namespace, coll: LocalCollection) -> Self {
        let storage = FakeStorage::default();
        storage.state.lock().unwrap().collections.insert(ns, coll);
        storage
    }

    pub fn collection(&self, ns: &Namespace) -> Option<LocalCollection> {
        self.state.lock().unwrap().collections.get(ns).cloned()
    }

    pub fn inserts(&self) -> Vec<usize> {
        self.state.lock().unwrap().inserts.clone()
    }

    pub fn index_builds(&self) -> Vec<(Namespace, Vec<String>)> {
        self.state.lock().unwrap().index_builds.clone()
    }

    pub fn created(&self) -> Vec<Namespace> {
        self.state.lock().unwrap().created.clone()
    }
}

/// a raw driver error carrying server code 26 (NamespaceNotFound).
pub fn namespace_not_found_driver_error() -> CloneError {
    let command_error: CommandError = bson::from_document(doc! {
        "code": 26,
        "codeName": "NamespaceNotFound",
        "errmsg": "ns does not exist",
    })
    .unwrap();
    CloneError::MongoError(MongoError::from(ErrorKind::Command(command_error)))
}

fn missing(ns: &Namespace) -> CloneError {
    CloneError::IllegalOperation(format!("{} doesn't exist locally", ns))
}

impl LocalStorage for FakeStorage {
    fn create_collection(&self, ns: &Namespace, options: &CollectionOptions) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.collections.contains_key(ns) {
            return Err(CloneError::NamespaceExists {
                ns: ns.to_string(),
                detail: "collection already exists".to_string(),
            });
        }
        state.created.push(ns.clone());
        state.collections.insert(
            ns.clone(),
            LocalCollection {
                uuid: options.uuid(),
                docs: vec![],
                index_names: vec!["_id_".to_string()],
            },
        );
        Ok(())
    }

    fn create_indexes_on_empty_collection(&self, ns: &Namespace, specs: &[IndexSpec]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let names: Vec<String> = specs.iter().map(|s| s.name().to_string()).collect();
        state.index_builds.push((ns.clone(), names.clone()));
        let coll = state.collections.get_mut(ns).ok_or_else(|| missing(ns))?;
        assert!(coll.docs.is_empty(), "indexes built on a non empty collection");
        coll.index_names.extend(names);
        Ok(())
    }

    fn lookup_by_uuid(&self, uuid: Uuid) -> Result<Option<Namespace>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .collections
            .iter()
            .find(|(_, coll)| coll.uuid == uuid)
            .map(|(ns, _)| ns.clone()))
    }

    fn insert_ordered(&self, ns: &Namespace, docs: Vec<Document>) -> Result<InsertResults> {
        let mut state = self.state.lock().unwrap();
        let call = state.inserts.len();
        state.inserts.push(docs.len());
        let fail_call = state.fail_insert_call == Some(call);
        let coll = state.collections.get_mut(ns).ok_or_else(|| missing(ns))?;
        let mut results = InsertResults::new();
        for (index, doc) in docs.into_iter().enumerate() {
            let id = id_of(&doc);
            if fail_call || coll.docs.iter().any(|d| id_of(d) == id) {
                results.push(Err(WriteFailure {
                    index,
                    code: DUPLICATE_KEY_CODE,
                    message: format!("E11000 duplicate key error, _id: {}", id),
                }));
                break;
            }
            coll.docs.push(doc);
            results.push(Ok(()));
        }
        Ok(results)
    }

    fn find_last_id(&self, ns: &Namespace) -> Result<Option<Bson>> {
        let state = self.state.lock().unwrap();
        let coll = state.collections.get(ns).ok_or_else(|| missing(ns))?;
        Ok(coll
            .docs
            .iter()
            .max_by_key(|d| id_of(d))
            .and_then(|d| d.get("_id").cloned()))
    }

    fn count_documents(&self, ns: &Namespace) -> Result<u64> {
        let state = self.state.lock().unwrap();
        let coll = state.collections.get(ns).ok_or_else(|| missing(ns))?;
        Ok(coll.docs.len() as u64)
    }

    fn list_index_names(&self, ns: &Namespace) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        if state.list_index_names_not_found {
            return Err(namespace_not_found_driver_error());
        }
        let coll = state.collections.get(ns).ok_or_else(|| missing(ns))?;
        Ok(coll.index_names.clone())
    }
}

/// Wires fakes, shared data and a real scheduler together.
pub struct Harness {
    pub source: Arc<FakeSource>,
    pub storage: Arc<FakeStorage>,
    pub shared_data: Arc<MigrationSharedData>,
    pub uuid: Uuid,
}

impl Harness {
    pub fn new(source: FakeSource, storage: FakeStorage, resuming: bool) -> Self {
        Self::with_uuid(source, storage, resuming, Uuid::new_v4())
    }

    pub fn with_uuid(source: FakeSource, storage: FakeStorage, resuming: bool, uuid: Uuid) -> Self {
        Harness {
            source: Arc::new(source),
            storage: Arc::new(storage),
            shared_data: Arc::new(MigrationSharedData::new(resuming)),
            uuid,
        }
    }

    pub fn context(&self) -> ClonerContext {
        ClonerContext {
            shared_data: self.shared_data.clone(),
            reader: self.source.clone(),
            storage: self.storage.clone(),
            scheduler: Arc::new(OrderedScheduler::new().unwrap()),
        }
    }

    pub fn cloner(&self, batch_size: u32) -> CollectionCloner {
        self.cloner_with_options(CollectionOptions::new(self.uuid), batch_size)
    }

    pub fn cloner_with_options(&self, options: CollectionOptions, batch_size: u32) -> CollectionCloner {
        CollectionCloner::new(
            source_nss(),
            options,
            TENANT_ID,
            "donor:27017",
            self.context(),
            ClonerOptions { batch_size },
        )
        .unwrap()
    }
}
