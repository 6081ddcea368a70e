//! Clones one donor collection: documents and index definitions.

use bson::{doc, Bson, Document, Timestamp};
use chrono::Utc;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use super::options::{split_id_index, AutoIndexId, CollectionOptions, IndexSpec, SourceCollection};
use super::scheduler::WorkScheduler;
use super::shared_data::MigrationSharedData;
use super::source::{FindQuery, SourceReader};
use super::stage::{run_stages, AfterStage, CloneOutcome, Stage, StagedCloner};
use super::stats::{ClonerStats, ProgressMeter};
use super::storage::LocalStorage;
use crate::error::{CloneError, Result};
use crate::{Namespace, DEFAULT_BATCH_SIZE, ID_KEY};

/// Tunables of one collection clone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClonerOptions {
    /// documents per network batch, server default when 0.
    pub batch_size: u32,
}

impl Default for ClonerOptions {
    fn default() -> Self {
        ClonerOptions {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Collaborators shared by every cloner of a migration.
#[derive(Clone)]
pub struct ClonerContext {
    /// migration wide state.
    pub shared_data: Arc<MigrationSharedData>,
    /// donor queries.
    pub reader: Arc<dyn SourceReader>,
    /// recipient storage.
    pub storage: Arc<dyn LocalStorage>,
    /// runs the local inserts.
    pub scheduler: Arc<dyn WorkScheduler>,
}

/// State touched by both the reading thread and the insert tasks, under one lock.
struct ClonerState {
    /// received batches waiting for their insert task, oldest first.
    documents_to_insert: VecDeque<Vec<Document>>,
    stats: ClonerStats,
    progress: ProgressMeter,
}

/// Clones one collection of a tenant from the donor.
///
/// Stages, in order:
/// 1. `count`: estimate the documents to copy.
/// 2. `checkIfDonorCollectionIsEmpty`: must happen before `listIndexes`.  If the donor
///    collection is empty now, any later document comes through oplog application, and
///    indexes are always built on an empty collection.
/// 3. `listIndexes`: capture index specs, trusted only once majority committed.
/// 4. `createCollection`: create the collection and its indexes, or find the collection of a
///    previous attempt and resume from its last `_id`.
/// 5. `query`: stream documents sorted by `_id` and insert them batch by batch, off the
///    reading thread.
pub struct CollectionCloner {
    source_nss: Namespace,
    collection_options: CollectionOptions,
    tenant_id: String,
    source: String,
    source_coll: SourceCollection,
    batch_size: u32,
    ctx: ClonerContext,

    /// namespace of the collection found locally with the donor's uuid, on resume.
    existing_nss: Option<Namespace>,
    id_index_spec: Option<IndexSpec>,
    ready_index_specs: Vec<IndexSpec>,
    /// `_id` of the last document present locally; the query restarts after it.
    last_doc_id: Option<Bson>,
    operation_time: Option<Timestamp>,
    donor_was_empty_before_list_indexes: bool,
    state: Arc<Mutex<ClonerState>>,
}

impl CollectionCloner {
    /// Create a cloner for donor collection `source_nss` of tenant `tenant_id`, read from
    /// donor node `source`.
    pub fn new(
        source_nss: Namespace,
        collection_options: CollectionOptions,
        tenant_id: impl Into<String>,
        source: impl Into<String>,
        ctx: ClonerContext,
        options: ClonerOptions,
    ) -> Result<CollectionCloner> {
        let tenant_id = tenant_id.into();
        if !source_nss.belongs_to_tenant(&tenant_id) {
            return Err(CloneError::InvalidNamespace(format!(
                "{} is not a namespace of tenant {}",
                source_nss, tenant_id
            )));
        }
        let source_coll = SourceCollection::new(source_nss.db(), collection_options.uuid());
        let state = ClonerState {
            documents_to_insert: VecDeque::new(),
            stats: ClonerStats::new(source_nss.to_string()),
            progress: ProgressMeter::new(
                format!("{} tenant collection clone progress", source_nss),
                "documents copied",
            ),
        };
        Ok(CollectionCloner {
            source_nss,
            collection_options,
            tenant_id,
            source: source.into(),
            source_coll,
            batch_size: options.batch_size,
            ctx,
            existing_nss: None,
            id_index_spec: None,
            ready_index_specs: vec![],
            last_doc_id: None,
            operation_time: None,
            donor_was_empty_before_list_indexes: false,
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Run every stage.  A collection dropped on the donor meanwhile is a clean
    /// [CloneOutcome::DroppedCleanly], not an error.
    pub fn run(&mut self) -> Result<CloneOutcome> {
        info!(
            namespace = %self.source_nss,
            uuid = %self.collection_options.uuid(),
            tenant_id = %self.tenant_id,
            source = %self.source,
            migration_id = %self.ctx.shared_data.migration_id(),
            "Tenant collection cloner starting."
        );
        let outcome = run_stages(self);
        info!(namespace = %self.source_nss, tenant_id = %self.tenant_id, ?outcome, stats = %self.stats(), "Tenant collection cloner finished.");
        outcome
    }

    /// snapshot of the clone statistics.
    pub fn stats(&self) -> ClonerStats {
        lock_state(&self.state).stats.clone()
    }

    /// donor namespace.
    pub fn source_nss(&self) -> &Namespace {
        &self.source_nss
    }

    /// `_id` after which the query stage reads, `None` means from the beginning.
    pub fn resume_cursor(&self) -> Option<&Bson> {
        self.last_doc_id.as_ref()
    }

    /// index specs captured by `listIndexes`, minus the ones skipped on resume.
    pub fn ready_index_specs(&self) -> &[IndexSpec] {
        &self.ready_index_specs
    }

    /// the `_id` index spec captured by `listIndexes`.
    pub fn id_index_spec(&self) -> Option<&IndexSpec> {
        self.id_index_spec.as_ref()
    }

    /// operation time of the `listIndexes` read.
    pub fn operation_time(&self) -> Option<Timestamp> {
        self.operation_time
    }

    /// did the emptiness check see an empty donor collection?
    pub fn donor_was_empty(&self) -> bool {
        self.donor_was_empty_before_list_indexes
    }

    fn count_stage(&mut self) -> Result<AfterStage> {
        let mut count = self.ctx.reader.count(&self.source_coll, doc! {})?;

        // The count may be negative after an unclean shutdown of the donor.  It's only used
        // for progress reporting.
        if count < 0 {
            warn!(
                namespace = %self.source_nss,
                tenant_id = %self.tenant_id,
                count,
                "Count command returned negative value. Updating to 0 to allow progress meter to function properly"
            );
            count = 0;
        }

        let mut state = lock_state(&self.state);
        state.progress.set_total_while_running(count as u64);
        state.stats.documents_to_copy = count as u64;
        Ok(AfterStage::Continue)
    }

    // The count above checks metadata which may not be accurate, so emptiness is checked with
    // a real read.
    fn check_if_donor_collection_is_empty_stage(&mut self) -> Result<AfterStage> {
        let first = self
            .ctx
            .reader
            .find_one(&self.source_coll, doc! {}, Some(doc! {ID_KEY: 1}))?;
        self.donor_was_empty_before_list_indexes = first.is_none();
        debug!(
            was_empty = self.donor_was_empty_before_list_indexes,
            namespace = %self.source_nss,
            tenant_id = %self.tenant_id,
            "Checked if donor collection was empty"
        );
        Ok(AfterStage::Continue)
    }

    fn list_indexes_stage(&mut self) -> Result<AfterStage> {
        self.operation_time = None;

        let index_specs = self.ctx.reader.list_indexes(&self.source_coll)?;
        let operation_time = self
            .ctx
            .reader
            .last_operation_time()
            .ok_or(CloneError::MissingOperationTime)?;
        self.operation_time = Some(operation_time);

        // Indexes listed but not majority committed could vanish in a donor rollback.
        self.ctx
            .reader
            .wait_until_majority_committed(operation_time)
            .map_err(|e| CloneError::MajorityWaitFailed {
                ts: operation_time,
                source: Box::new(e),
            })?;

        if index_specs.is_empty() {
            warn!(
                namespace = %self.source_nss,
                source = %self.source,
                tenant_id = %self.tenant_id,
                "No indexes found for collection while cloning"
            );
        }
        let (id_index_spec, ready_index_specs) = split_id_index(index_specs);
        self.id_index_spec = id_index_spec;
        self.ready_index_specs = ready_index_specs;
        lock_state(&self.state).stats.indexes =
            self.ready_index_specs.len() + usize::from(self.id_index_spec.is_some());

        let auto_index_id = self.collection_options.auto_index_id();
        if self.id_index_spec.is_none() && auto_index_id != AutoIndexId::No {
            return Err(CloneError::IllegalOperation(format!(
                "Found empty '_id' index spec but the collection is not specified with 'autoIndexId' as false, tenantId: {}, namespace: {}",
                self.tenant_id, self.source_nss
            )));
        }
        if self.id_index_spec.is_some() && auto_index_id == AutoIndexId::No {
            warn!(
                namespace = %self.source_nss,
                tenant_id = %self.tenant_id,
                "Found the _id index spec but the collection specified autoIndexId of false"
            );
        }
        Ok(AfterStage::Continue)
    }

    fn create_collection_stage(&mut self) -> Result<AfterStage> {
        let storage = Arc::clone(&self.ctx.storage);
        let uuid = self.collection_options.uuid();
        let mut skip_create_indexes = false;

        match storage.lookup_by_uuid(uuid)? {
            Some(existing) => {
                if !existing.belongs_to_tenant(&self.tenant_id) {
                    return Err(CloneError::NotOwnedByTenant {
                        uuid,
                        ns: existing.to_string(),
                        tenant_id: self.tenant_id.clone(),
                    });
                }
                if existing.db() != self.source_nss.db() {
                    return Err(CloneError::DatabaseMismatch {
                        uuid,
                        ns: existing.to_string(),
                        expected_db: self.source_nss.db().to_string(),
                    });
                }
                if !self.ctx.shared_data.is_resuming() {
                    return Err(CloneError::NamespaceExists {
                        ns: existing.to_string(),
                        detail: format!(
                            "tenant '{}': collection already exists prior to data sync",
                            self.tenant_id
                        ),
                    });
                }

                info!(
                    existing_namespace = %existing,
                    source_namespace = %self.source_nss,
                    %uuid,
                    migration_id = %self.ctx.shared_data.migration_id(),
                    tenant_id = %self.tenant_id,
                    "TenantCollectionCloner found collection with same uuid."
                );

                self.last_doc_id = storage.find_last_id(&existing)?;
                if self.last_doc_id.is_some() {
                    // Not empty: a previous attempt already built the indexes, resume from
                    // the last document.
                    skip_create_indexes = true;
                    self.ready_index_specs.clear();
                    let count = storage.count_documents(&existing)?;
                    let mut state = lock_state(&self.state);
                    state.stats.documents_copied += count;
                    state.progress.hit(count);
                    info!(
                        namespace = %existing,
                        count,
                        last_doc_id = ?self.last_doc_id,
                        "Resume cloning after the last local document."
                    );
                } else {
                    // Still empty: build only the indexes we haven't built yet.  Indexes
                    // present locally but not on the donor stay, oplog application drops them.
                    let existing_index_names: HashSet<String> =
                        storage.list_index_names(&existing)?.into_iter().collect();
                    self.ready_index_specs
                        .retain(|spec| !existing_index_names.contains(spec.name()));
                }
                self.existing_nss = Some(existing);
            }
            None => {
                // No collection with the same uuid.  A NamespaceExists failure here means the
                // namespace is taken under another uuid, which fails the migration too.
                storage.create_collection(&self.source_nss, &self.collection_options)?;
            }
        }

        if !skip_create_indexes {
            let target = self.target_nss().clone();
            storage
                .create_indexes_on_empty_collection(&target, &self.ready_index_specs)
                .map_err(|e| CloneError::IndexBuildFailed {
                    ns: target.to_string(),
                    source: Box::new(e),
                })?;
        }
        Ok(AfterStage::Continue)
    }

    fn query_stage(&mut self) -> Result<AfterStage> {
        if self.donor_was_empty_before_list_indexes {
            warn!(
                namespace = %self.source_nss,
                tenant_id = %self.tenant_id,
                "Collection was empty at clone time."
            );
            return Ok(AfterStage::Continue);
        }

        self.run_query()?;
        self.ctx.scheduler.drain_all()?;
        if self.ctx.shared_data.must_exit() {
            return Err(CloneError::Cancelled);
        }
        Ok(AfterStage::Continue)
    }

    fn run_query(&self) -> Result<()> {
        let filter = match &self.last_doc_id {
            None => doc! {},
            // $expr and the aggregation $gt avoid type bracketing.
            Some(last_id) => doc! {"$expr": {"$gt": [format!("${}", ID_KEY), last_id.clone()]}},
        };
        let query = FindQuery::by_id(filter, self.batch_size);

        let reader = Arc::clone(&self.ctx.reader);
        for batch in reader.streaming_find(&self.source_coll, query)? {
            self.handle_next_batch(batch?)?;
            if let Some(ts) = reader.last_operation_time() {
                self.ctx.shared_data.advance_last_visible_op_time(ts);
            }
            if self.ctx.shared_data.must_exit() {
                info!(namespace = %self.source_nss, tenant_id = %self.tenant_id, "Stop reading from donor, cloner must exit.");
                break;
            }
        }
        Ok(())
    }

    fn handle_next_batch(&self, batch: Vec<Document>) -> Result<()> {
        {
            let mut state = lock_state(&self.state);
            state.stats.received_batches += 1;
            state.documents_to_insert.push_back(batch);
        }

        let state = Arc::clone(&self.state);
        let storage = Arc::clone(&self.ctx.storage);
        let shared_data = Arc::clone(&self.ctx.shared_data);
        let target = self.target_nss().clone();
        let tenant_id = self.tenant_id.clone();
        self.ctx.scheduler.schedule(Box::new(move || {
            let result = insert_documents(&state, storage.as_ref(), &target, &tenant_id);
            if let Err(e) = &result {
                shared_data.set_sync_failed(e.to_string());
            }
            result
        }))?;
        Ok(())
    }

    /// Local namespace documents and indexes go to.
    fn target_nss(&self) -> &Namespace {
        self.existing_nss.as_ref().unwrap_or(&self.source_nss)
    }
}

/// Insert the oldest batch waiting in `state` into `target`.
fn insert_documents(
    state: &Mutex<ClonerState>,
    storage: &dyn LocalStorage,
    target: &Namespace,
    tenant_id: &str,
) -> Result<()> {
    let docs = {
        let mut state = lock_state(state);
        let docs = match state.documents_to_insert.pop_front() {
            Some(docs) => docs,
            None => {
                warn!(namespace = %target, %tenant_id, "insertDocuments task, but no documents to insert");
                return Ok(());
            }
        };
        state.stats.documents_copied += docs.len() as u64;
        state.stats.inserted_batches += 1;
        state.progress.hit(docs.len() as u64);
        docs
    };

    let expected = docs.len();
    let results = storage.insert_ordered(target, docs)?;
    // ordered insert stops at the first failure, so only the last result matters.
    match results.last() {
        Some(Err(failure)) => Err(CloneError::InsertFailed {
            ns: target.to_string(),
            failure: failure.clone(),
        }),
        _ if results.len() != expected => Err(CloneError::InsertFailed {
            ns: target.to_string(),
            failure: crate::WriteFailure {
                index: results.len(),
                code: 0,
                message: format!("{} of {} documents inserted", results.len(), expected),
            },
        }),
        _ => Ok(()),
    }
}

fn lock_state(state: &Mutex<ClonerState>) -> MutexGuard<'_, ClonerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StagedCloner for CollectionCloner {
    const STAGES: &'static [Stage<Self>] = &[
        Stage {
            name: "count",
            run: CollectionCloner::count_stage,
        },
        Stage {
            name: "checkIfDonorCollectionIsEmpty",
            run: CollectionCloner::check_if_donor_collection_is_empty_stage,
        },
        Stage {
            name: "listIndexes",
            run: CollectionCloner::list_indexes_stage,
        },
        Stage {
            name: "createCollection",
            run: CollectionCloner::create_collection_stage,
        },
        Stage {
            name: "query",
            run: CollectionCloner::query_stage,
        },
    ];

    fn pre_stage(&mut self) {
        lock_state(&self.state).stats.start = Some(Utc::now());
    }

    fn post_stage(&mut self) {
        lock_state(&self.state).stats.end = Some(Utc::now());
    }

    fn wait_for_database_work(&self) -> Result<()> {
        self.ctx.scheduler.drain_all()
    }

    fn must_exit(&self) -> bool {
        self.ctx.shared_data.must_exit()
    }

    fn context(&self) -> (String, String) {
        (self.source_nss.to_string(), self.tenant_id.clone())
    }
}
