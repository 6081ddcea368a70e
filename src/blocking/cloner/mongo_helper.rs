use bson::{doc, Bson, Document};
use mongodb::sync::{Client, Database};
use uuid::Uuid;

use super::bson_helper::{self, get_number, take_documents};
use super::options::CollectionOptions;
use crate::{Namespace, Result};

/// databases which never hold tenant data.
const INTERNAL_DBS: [&str; 3] = ["admin", "local", "config"];

/// Run a cursor returning command (`listCollections`, `listIndexes`, ...) and collect every
/// document of the cursor, following it with `getMore` until it's exhausted.
pub fn run_cursor_command(db: &Database, cmd: Document) -> Result<Vec<Document>> {
    let mut reply = db.run_command(cmd, None)?;
    let cursor = reply.get_document_mut("cursor")?;
    let mut cursor_id = get_number(cursor, "id")?;
    let coll_name = Namespace::parse(cursor.get_str("ns")?)?.coll().to_string();
    let mut docs = take_documents(cursor, "firstBatch")?;

    while cursor_id != 0 {
        let mut reply = db.run_command(
            doc! {"getMore": Bson::Int64(cursor_id), "collection": coll_name.as_str()},
            None,
        )?;
        let cursor = reply.get_document_mut("cursor")?;
        cursor_id = get_number(cursor, "id")?;
        docs.extend(take_documents(cursor, "nextBatch")?);
    }
    Ok(docs)
}

/// get every regular collection of `db`, along with its creation options.
///
/// Views and `system.*` collections are skipped, they are never cloned.
pub fn list_source_collections(db: &Database) -> Result<Vec<(Namespace, CollectionOptions)>> {
    // Collection info object:
    // { name: `collection_name`, type: "collection", options: {..}, info: {uuid: `uuid`} }
    let infos = run_cursor_command(
        db,
        doc! {"listCollections": 1, "filter": {"type": "collection"}},
    )?;
    let mut result = Vec::with_capacity(infos.len());
    for info in infos {
        let ns = Namespace::new(db.name(), info.get_str("name")?);
        if ns.is_system() {
            continue;
        }
        result.push((ns, CollectionOptions::from_collection_info(&info)?));
    }
    Ok(result)
}

/// find the namespace of the collection with `uuid`, in any non internal database.
pub fn find_collection_by_uuid(client: &Client, uuid: Uuid) -> Result<Option<Namespace>> {
    for db_name in client.list_database_names(None, None)? {
        if INTERNAL_DBS.contains(&db_name.as_str()) {
            continue;
        }
        let db = client.database(&db_name);
        let infos = run_cursor_command(
            &db,
            doc! {
                "listCollections": 1,
                "filter": {"info.uuid": bson_helper::new_bson_binary(uuid)},
                "nameOnly": false,
            },
        )?;
        if let Some(info) = infos.first() {
            return Ok(Some(Namespace::new(db_name.as_str(), info.get_str("name")?)));
        }
    }
    Ok(None)
}
