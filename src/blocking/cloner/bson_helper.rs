use bson::document::{ValueAccessError, ValueAccessResult};
use bson::spec::BinarySubtype;
use bson::{Binary, Bson, Document};
use uuid::Uuid;

/// Get a uuid value for this `key` if it exists and has the correct type for given `doc`.
pub fn get_uuid(doc: &Document, key: &str) -> ValueAccessResult<Uuid> {
    match doc.get(key) {
        Some(Bson::Binary(Binary {
            subtype: BinarySubtype::Uuid,
            bytes,
        })) => Uuid::from_slice(bytes).map_err(|_| ValueAccessError::UnexpectedType),
        Some(_) => Err(ValueAccessError::UnexpectedType),
        None => Err(ValueAccessError::NotPresent),
    }
}

/// Create a new bson::Binary from given `uuid`.
pub fn new_binary(uuid: Uuid) -> Binary {
    Binary {
        subtype: BinarySubtype::Uuid,
        bytes: uuid.as_bytes().to_vec(),
    }
}

/// Create a new bson value from given `uuid`, commands can address a collection with it.
pub fn new_bson_binary(uuid: Uuid) -> Bson {
    Bson::Binary(new_binary(uuid))
}

/// Get a numeric value for `key`, servers reply with int32, int64 or double depending on size.
pub fn get_number(doc: &Document, key: &str) -> ValueAccessResult<i64> {
    match doc.get(key) {
        Some(Bson::Int32(v)) => Ok(*v as i64),
        Some(Bson::Int64(v)) => Ok(*v),
        Some(Bson::Double(v)) => Ok(*v as i64),
        Some(_) => Err(ValueAccessError::UnexpectedType),
        None => Err(ValueAccessError::NotPresent),
    }
}

/// Take documents out of an array field (`firstBatch`, `nextBatch`).
pub fn take_documents(doc: &mut Document, key: &str) -> ValueAccessResult<Vec<Document>> {
    match doc.remove(key) {
        Some(Bson::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Bson::Document(d) => Ok(d),
                _ => Err(ValueAccessError::UnexpectedType),
            })
            .collect(),
        Some(_) => Err(ValueAccessError::UnexpectedType),
        None => Err(ValueAccessError::NotPresent),
    }
}
