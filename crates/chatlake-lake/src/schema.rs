//! Versioned record schemas and read-side projection.
//!
//! Evolution policy is additive-only: a new version may add nullable fields,
//! never remove or retype them. Renames are carried as a mapping table so
//! old column names resolve on read. The one type widening in the system
//! (integer → string `source`) happens in the compaction normalizer, before
//! records ever reach a columnar file.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use arrow::array::{new_null_array, ArrayRef, RecordBatch};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};

use crate::error::{LakeError, Result};

pub const CANONICAL_MESSAGES: &str = "canonical_messages";
pub const CONTACTS: &str = "contacts";

/// Arrow schema of the canonical message dataset, version 1.
///
/// Partition keys (year/month/day) are directory names, not columns.
pub fn message_schema_v1() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("msg_id", DataType::Utf8, false),
        Field::new("from_user", DataType::Utf8, true),
        Field::new("to_user", DataType::Utf8, true),
        Field::new("chatroom", DataType::Utf8, true),
        Field::new("chatroom_sender", DataType::Utf8, true),
        Field::new("msg_type", DataType::Int32, true),
        Field::new(
            "create_time",
            DataType::Timestamp(TimeUnit::Second, Some("UTC".into())),
            false,
        ),
        Field::new("is_chatroom_msg", DataType::Int8, true),
        Field::new("content", DataType::Utf8, true),
        Field::new("source", DataType::Utf8, true),
        Field::new("guid", DataType::Utf8, true),
        Field::new("notify_type", DataType::Int64, true),
        Field::new(
            "ingestion_time",
            DataType::Timestamp(TimeUnit::Second, Some("UTC".into())),
            true,
        ),
    ]))
}

/// Arrow schema of the contact-sync dataset, version 1.
pub fn contact_schema_v1() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("username", DataType::Utf8, false),
        Field::new("nickname", DataType::Utf8, true),
        Field::new("remark", DataType::Utf8, true),
        Field::new("avatar", DataType::Utf8, true),
        Field::new("contact_type", DataType::Utf8, true),
        Field::new(
            "ingestion_time",
            DataType::Timestamp(TimeUnit::Second, Some("UTC".into())),
            true,
        ),
    ]))
}

/// In-memory registry of `(name, version) → schema` plus rename mappings.
pub struct SchemaRegistry {
    schemas: BTreeMap<(String, u32), SchemaRef>,
    /// `(schema_name, old_column) → current_column`.
    renames: HashMap<(String, String), String>,
}

impl SchemaRegistry {
    /// Registry pre-loaded with the built-in dataset schemas.
    pub fn with_builtin() -> Self {
        let mut registry = Self {
            schemas: BTreeMap::new(),
            renames: HashMap::new(),
        };
        registry
            .register(CANONICAL_MESSAGES, 1, message_schema_v1())
            .expect("builtin schema registers once");
        registry
            .register(CONTACTS, 1, contact_schema_v1())
            .expect("builtin schema registers once");
        registry
    }

    /// Store a schema under `(name, version)`. The pair must be unique.
    pub fn register(&mut self, name: &str, version: u32, schema: SchemaRef) -> Result<()> {
        let key = (name.to_string(), version);
        if self.schemas.contains_key(&key) {
            return Err(LakeError::Schema(format!(
                "schema {name} version {version} already registered"
            )));
        }
        self.schemas.insert(key, schema);
        Ok(())
    }

    /// Record that `old_column` in `name` is now called `new_column`.
    pub fn register_rename(&mut self, name: &str, old_column: &str, new_column: &str) {
        self.renames.insert(
            (name.to_string(), old_column.to_string()),
            new_column.to_string(),
        );
    }

    /// Resolve a possibly-renamed column to its current name.
    pub fn resolve_column<'a>(&'a self, name: &str, column: &'a str) -> &'a str {
        self.renames
            .get(&(name.to_string(), column.to_string()))
            .map(String::as_str)
            .unwrap_or(column)
    }

    /// Highest registered version of `name`.
    pub fn latest(&self, name: &str) -> Result<(u32, SchemaRef)> {
        self.schemas
            .range((name.to_string(), 0)..=(name.to_string(), u32::MAX))
            .next_back()
            .map(|((_, v), schema)| (*v, schema.clone()))
            .ok_or_else(|| LakeError::Schema(format!("no schema registered under {name}")))
    }

    pub fn get(&self, name: &str, version: u32) -> Option<SchemaRef> {
        self.schemas.get(&(name.to_string(), version)).cloned()
    }

    /// All registered entries, for mirroring into the metadata store.
    pub fn entries(&self) -> impl Iterator<Item = (&str, u32, &SchemaRef)> {
        self.schemas
            .iter()
            .map(|((name, version), schema)| (name.as_str(), *version, schema))
    }

    /// Project a batch written under an older schema onto the latest one.
    ///
    /// Columns the batch lacks come back as typed nulls; columns the latest
    /// schema dropped never exist (the policy forbids removal), so the
    /// output always matches the latest schema exactly. Renamed source
    /// columns resolve through the mapping table.
    pub fn project_to_latest(&self, name: &str, batch: &RecordBatch) -> Result<RecordBatch> {
        let (_, latest) = self.latest(name)?;
        if batch.schema().as_ref() == latest.as_ref() {
            return Ok(batch.clone());
        }

        let rows = batch.num_rows();
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(latest.fields().len());
        for field in latest.fields() {
            let source_index = batch.schema().index_of(field.name()).ok().or_else(|| {
                // A renamed column carries its old name in older files.
                self.renames
                    .iter()
                    .find(|(key, new_name)| {
                        let field_name: &str = field.name();
                        key.0 == name && new_name.as_str() == field_name
                    })
                    .and_then(|(key, _)| batch.schema().index_of(&key.1).ok())
            });
            match source_index {
                Some(i) => columns.push(batch.column(i).clone()),
                None => columns.push(new_null_array(field.data_type(), rows)),
            }
        }
        RecordBatch::try_new(latest, columns).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int32Array, StringArray};

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut r = SchemaRegistry::with_builtin();
        let err = r.register(CANONICAL_MESSAGES, 1, message_schema_v1());
        assert!(matches!(err, Err(LakeError::Schema(_))));
    }

    #[test]
    fn latest_picks_highest_version() {
        let mut r = SchemaRegistry::with_builtin();
        let v2 = Arc::new(Schema::new(vec![Field::new(
            "msg_id",
            DataType::Utf8,
            false,
        )]));
        r.register(CANONICAL_MESSAGES, 2, v2.clone()).unwrap();
        let (version, schema) = r.latest(CANONICAL_MESSAGES).unwrap();
        assert_eq!(version, 2);
        assert_eq!(schema, v2);
    }

    #[test]
    fn unknown_schema_errors() {
        let r = SchemaRegistry::with_builtin();
        assert!(r.latest("nope").is_err());
    }

    #[test]
    fn projection_fills_missing_columns_with_nulls() {
        let mut r = SchemaRegistry::with_builtin();
        // v1 of a toy dataset has one column; v2 adds a nullable one.
        let v1 = Arc::new(Schema::new(vec![Field::new("a", DataType::Utf8, false)]));
        let v2 = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Utf8, false),
            Field::new("b", DataType::Int32, true),
        ]));
        r.register("toy", 1, v1.clone()).unwrap();
        r.register("toy", 2, v2).unwrap();

        let batch = RecordBatch::try_new(
            v1,
            vec![Arc::new(StringArray::from(vec!["x", "y"])) as ArrayRef],
        )
        .unwrap();

        let projected = r.project_to_latest("toy", &batch).unwrap();
        assert_eq!(projected.num_columns(), 2);
        assert_eq!(projected.column(1).null_count(), 2);
    }

    #[test]
    fn projection_resolves_renamed_columns() {
        let mut r = SchemaRegistry::with_builtin();
        let v1 = Arc::new(Schema::new(vec![Field::new("uid", DataType::Int32, false)]));
        let v2 = Arc::new(Schema::new(vec![Field::new(
            "user_id",
            DataType::Int32,
            false,
        )]));
        r.register("toy", 1, v1.clone()).unwrap();
        r.register("toy", 2, v2).unwrap();
        r.register_rename("toy", "uid", "user_id");

        let batch = RecordBatch::try_new(
            v1,
            vec![Arc::new(Int32Array::from(vec![7, 8])) as ArrayRef],
        )
        .unwrap();

        let projected = r.project_to_latest("toy", &batch).unwrap();
        assert_eq!(projected.schema().field(0).name(), "user_id");
        assert_eq!(projected.column(0).null_count(), 0);
    }
}
