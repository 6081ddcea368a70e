//! Collection options and index specifications captured from the donor.

use bson::{Bson, Document};
use uuid::Uuid;

use super::bson_helper;
use crate::{Result, ID_INDEX_NAME};

/// Whether collection creation builds the `_id` index implicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoIndexId {
    /// option not specified, the server default (build it) applies.
    Default,
    /// `autoIndexId: true`.
    Yes,
    /// `autoIndexId: false`.
    No,
}

/// Declarative properties of a collection at creation time.
///
/// Captured once from the donor's `listCollections` entry, never changed afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionOptions {
    uuid: Uuid,
    auto_index_id: AutoIndexId,
    /// the raw `options` document, passed through to collection creation.
    raw: Document,
}

impl CollectionOptions {
    /// options for a collection with `uuid` and default creation options.
    pub fn new(uuid: Uuid) -> Self {
        CollectionOptions {
            uuid,
            auto_index_id: AutoIndexId::Default,
            raw: Document::new(),
        }
    }

    /// Parse a `listCollections` entry:
    /// `{ name: "coll", type: "collection", options: {...}, info: { uuid: UUID(..) } }`
    pub fn from_collection_info(info: &Document) -> Result<Self> {
        let uuid = bson_helper::get_uuid(info.get_document("info")?, "uuid")?;
        let raw = match info.get("options") {
            Some(Bson::Document(options)) => options.clone(),
            _ => Document::new(),
        };
        Ok(Self::from_options_document(uuid, raw))
    }

    /// Build from an `options` document as the server reports it.
    pub fn from_options_document(uuid: Uuid, raw: Document) -> Self {
        let auto_index_id = match raw.get_bool("autoIndexId") {
            Ok(true) => AutoIndexId::Yes,
            Ok(false) => AutoIndexId::No,
            Err(_) => AutoIndexId::Default,
        };
        CollectionOptions {
            uuid,
            auto_index_id,
            raw,
        }
    }

    /// set `autoIndexId`.
    pub fn with_auto_index_id(mut self, auto_index_id: AutoIndexId) -> Self {
        match auto_index_id {
            AutoIndexId::Default => {
                self.raw.remove("autoIndexId");
            }
            AutoIndexId::Yes => {
                self.raw.insert("autoIndexId", true);
            }
            AutoIndexId::No => {
                self.raw.insert("autoIndexId", false);
            }
        }
        self.auto_index_id = auto_index_id;
        self
    }

    /// stable collection identifier.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// `autoIndexId` setting.
    pub fn auto_index_id(&self) -> AutoIndexId {
        self.auto_index_id
    }

    /// raw creation options, without the uuid.
    pub fn as_document(&self) -> &Document {
        &self.raw
    }
}

/// An index descriptor as returned by `listIndexes`.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSpec(Document);

impl IndexSpec {
    /// wrap a `listIndexes` entry.
    pub fn new(spec: Document) -> Self {
        IndexSpec(spec)
    }

    /// index name, empty when the spec has none.
    pub fn name(&self) -> &str {
        self.0.get_str("name").unwrap_or_default()
    }

    /// is this the implicit primary key index?
    pub fn is_id_index(&self) -> bool {
        self.name() == ID_INDEX_NAME
    }

    /// raw spec document.
    pub fn as_document(&self) -> &Document {
        &self.0
    }

    /// consume into the raw spec document.
    pub fn into_document(self) -> Document {
        self.0
    }
}

/// Donor side address of a collection: its database plus its stable uuid.
///
/// Queries address the collection by uuid, so a rename on the donor doesn't break cloning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceCollection {
    db_name: String,
    uuid: Uuid,
}

impl SourceCollection {
    /// collection `uuid` inside donor database `db_name`.
    pub fn new(db_name: impl Into<String>, uuid: Uuid) -> Self {
        SourceCollection {
            db_name: db_name.into(),
            uuid,
        }
    }

    /// donor database name.
    pub fn db(&self) -> &str {
        &self.db_name
    }

    /// collection uuid.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }
}

/// Split `specs` into the `_id` index spec and all the others, in their original order.
pub fn split_id_index(specs: Vec<IndexSpec>) -> (Option<IndexSpec>, Vec<IndexSpec>) {
    let mut id_index = None;
    let mut others = Vec::with_capacity(specs.len());
    for spec in specs {
        if spec.is_id_index() {
            id_index = Some(spec);
        } else {
            others.push(spec);
        }
    }
    (id_index, others)
}
