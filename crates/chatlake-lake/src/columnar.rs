//! Parquet encode/decode for the lake's datasets.
//!
//! Files carry the `.col` extension but are standard Parquet. Dictionary
//! encoding is enabled only for the low-cardinality columns; the codec comes
//! from configuration ("snappy" default, "zstd" for archive partitions).

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, Int32Array, Int64Array, Int8Array, RecordBatch, StringArray,
    TimestampSecondArray,
};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::properties::WriterProperties;
use parquet::file::statistics::Statistics;
use parquet::schema::types::ColumnPath;

use chatlake_core::types::{CanonicalMessage, ContactRecord};

use crate::error::{classify_io, LakeError, Result};
use crate::partition::COLUMNAR_EXT;
use crate::schema::{contact_schema_v1, message_schema_v1};

/// Columns that dictionary-encode well in the message dataset.
const DICTIONARY_COLUMNS: [&str; 4] = ["from_user", "to_user", "chatroom", "msg_type"];

/// Outcome of writing one columnar file.
#[derive(Debug, Clone)]
pub struct WrittenFile {
    pub path: PathBuf,
    pub rows: usize,
    pub bytes: u64,
    pub min_create_time: i64,
    pub max_create_time: i64,
}

fn codec(compression: &str) -> Result<Compression> {
    match compression {
        "snappy" => Ok(Compression::SNAPPY),
        "zstd" => Ok(Compression::ZSTD(ZstdLevel::default())),
        "none" | "uncompressed" => Ok(Compression::UNCOMPRESSED),
        other => Err(LakeError::Columnar(format!("unknown compression codec: {other}"))),
    }
}

fn message_writer_properties(compression: &str) -> Result<WriterProperties> {
    let mut builder = WriterProperties::builder()
        .set_compression(codec(compression)?)
        .set_dictionary_enabled(false);
    for column in DICTIONARY_COLUMNS {
        builder = builder.set_column_dictionary_enabled(ColumnPath::from(column), true);
    }
    Ok(builder.build())
}

/// Encode messages into an Arrow batch under the v1 schema.
pub fn messages_to_batch(messages: &[CanonicalMessage]) -> Result<RecordBatch> {
    let schema = message_schema_v1();
    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter_values(
            messages.iter().map(|m| m.msg_id.as_str()),
        )),
        Arc::new(StringArray::from_iter_values(
            messages.iter().map(|m| m.from_user.as_str()),
        )),
        Arc::new(StringArray::from_iter_values(
            messages.iter().map(|m| m.to_user.as_str()),
        )),
        Arc::new(StringArray::from_iter_values(
            messages.iter().map(|m| m.chatroom.as_str()),
        )),
        Arc::new(StringArray::from_iter_values(
            messages.iter().map(|m| m.chatroom_sender.as_str()),
        )),
        Arc::new(Int32Array::from_iter_values(
            messages.iter().map(|m| m.msg_type),
        )),
        Arc::new(
            TimestampSecondArray::from_iter_values(messages.iter().map(|m| m.create_time))
                .with_timezone("UTC"),
        ),
        Arc::new(Int8Array::from_iter_values(
            messages.iter().map(|m| i8::from(m.is_chatroom_msg)),
        )),
        Arc::new(StringArray::from_iter_values(
            messages.iter().map(|m| m.content.as_str()),
        )),
        Arc::new(StringArray::from_iter_values(
            messages.iter().map(|m| m.source.as_str()),
        )),
        Arc::new(StringArray::from_iter_values(
            messages.iter().map(|m| m.guid.as_str()),
        )),
        Arc::new(Int64Array::from_iter_values(
            messages.iter().map(|m| m.notify_type),
        )),
        Arc::new(
            TimestampSecondArray::from_iter_values(messages.iter().map(|m| m.ingestion_time))
                .with_timezone("UTC"),
        ),
    ];
    RecordBatch::try_new(schema, columns).map_err(Into::into)
}

/// Write messages as one Parquet file, fsynced before return.
pub fn write_messages(path: &Path, messages: &[CanonicalMessage], compression: &str) -> Result<WrittenFile> {
    let batch = messages_to_batch(messages)?;
    let props = message_writer_properties(compression)?;

    let file = File::create(path).map_err(|e| classify_io(e, "create columnar file"))?;
    let handle = file
        .try_clone()
        .map_err(|e| classify_io(e, "clone columnar file handle"))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    handle
        .sync_all()
        .map_err(|e| classify_io(e, "fsync columnar file"))?;

    let bytes = std::fs::metadata(path)
        .map_err(|e| classify_io(e, "stat columnar file"))?
        .len();
    let min_create_time = messages.iter().map(|m| m.create_time).min().unwrap_or(0);
    let max_create_time = messages.iter().map(|m| m.create_time).max().unwrap_or(0);
    Ok(WrittenFile {
        path: path.to_path_buf(),
        rows: messages.len(),
        bytes,
        min_create_time,
        max_create_time,
    })
}

/// Write contact-sync records as one Parquet file.
pub fn write_contacts(path: &Path, contacts: &[ContactRecord], compression: &str) -> Result<WrittenFile> {
    let schema = contact_schema_v1();
    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter_values(
            contacts.iter().map(|c| c.username.as_str()),
        )),
        Arc::new(StringArray::from_iter_values(
            contacts.iter().map(|c| c.nickname.as_str()),
        )),
        Arc::new(StringArray::from_iter_values(
            contacts.iter().map(|c| c.remark.as_str()),
        )),
        Arc::new(StringArray::from_iter_values(
            contacts.iter().map(|c| c.avatar.as_str()),
        )),
        Arc::new(StringArray::from_iter_values(
            contacts.iter().map(|c| c.contact_type.as_str()),
        )),
        Arc::new(
            TimestampSecondArray::from_iter_values(contacts.iter().map(|c| c.ingestion_time))
                .with_timezone("UTC"),
        ),
    ];
    let batch = RecordBatch::try_new(schema, columns)?;

    let props = WriterProperties::builder()
        .set_compression(codec(compression)?)
        .build();
    let file = File::create(path).map_err(|e| classify_io(e, "create columnar file"))?;
    let handle = file
        .try_clone()
        .map_err(|e| classify_io(e, "clone columnar file handle"))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(&batch)?;
    writer.close()?;
    handle
        .sync_all()
        .map_err(|e| classify_io(e, "fsync columnar file"))?;

    let bytes = std::fs::metadata(path)
        .map_err(|e| classify_io(e, "stat columnar file"))?
        .len();
    let times = contacts.iter().map(|c| c.ingestion_time);
    Ok(WrittenFile {
        path: path.to_path_buf(),
        rows: contacts.len(),
        bytes,
        min_create_time: times.clone().min().unwrap_or(0),
        max_create_time: times.max().unwrap_or(0),
    })
}

/// A reader over one columnar file, optionally projected to a column subset
/// and pruned to row groups whose `create_time` statistics overlap a range.
pub struct ColumnarReader {
    reader: parquet::arrow::arrow_reader::ParquetRecordBatchReader,
}

impl ColumnarReader {
    pub fn open(
        path: &Path,
        columns: Option<&[&str]>,
        time_range: Option<(i64, i64)>,
    ) -> Result<Self> {
        let file = File::open(path).map_err(|e| classify_io(e, "open columnar file"))?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;

        let builder = if let Some((min, max)) = time_range {
            let indices = prune_row_groups(builder.metadata(), min, max);
            builder.with_row_groups(indices)
        } else {
            builder
        };

        let builder = if let Some(names) = columns {
            let arrow_schema = builder.schema().clone();
            let mut indices = Vec::with_capacity(names.len());
            for name in names {
                let idx = arrow_schema.index_of(name).map_err(|_| {
                    LakeError::Schema(format!("projected column not in file: {name}"))
                })?;
                indices.push(idx);
            }
            let mask =
                parquet::arrow::ProjectionMask::roots(builder.parquet_schema(), indices);
            builder.with_projection(mask)
        } else {
            builder
        };

        Ok(Self {
            reader: builder.build()?,
        })
    }
}

impl Iterator for ColumnarReader {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.reader
            .next()
            .map(|r| r.map_err(|e| LakeError::Columnar(e.to_string())))
    }
}

/// Row groups whose create_time min/max statistics overlap `[min, max]`.
/// Groups without statistics are kept (no basis to exclude them).
fn prune_row_groups(
    metadata: &parquet::file::metadata::ParquetMetaData,
    min: i64,
    max: i64,
) -> Vec<usize> {
    let Some(col_idx) = metadata
        .file_metadata()
        .schema_descr()
        .columns()
        .iter()
        .position(|c| c.name() == "create_time")
    else {
        return (0..metadata.num_row_groups()).collect();
    };

    (0..metadata.num_row_groups())
        .filter(|&i| {
            let column = metadata.row_group(i).column(col_idx);
            match column.statistics() {
                Some(Statistics::Int64(stats)) => {
                    let lo = stats.min_opt().copied().unwrap_or(i64::MIN);
                    let hi = stats.max_opt().copied().unwrap_or(i64::MAX);
                    hi >= min && lo <= max
                }
                _ => true,
            }
        })
        .collect()
}

/// Decode a (possibly projected) batch back into messages. Columns absent
/// from the projection come back as defaults.
pub fn batch_to_messages(batch: &RecordBatch) -> Result<Vec<CanonicalMessage>> {
    fn col<'a, A: 'static>(batch: &'a RecordBatch, name: &str) -> Option<&'a A> {
        batch
            .column_by_name(name)
            .and_then(|c| c.as_any().downcast_ref::<A>())
    }
    fn get_str(col: Option<&StringArray>, i: usize) -> String {
        col.filter(|c| !c.is_null(i))
            .map(|c| c.value(i).to_string())
            .unwrap_or_default()
    }

    let rows = batch.num_rows();
    let msg_id: Option<&StringArray> = col(batch, "msg_id");
    let from_user: Option<&StringArray> = col(batch, "from_user");
    let to_user: Option<&StringArray> = col(batch, "to_user");
    let chatroom: Option<&StringArray> = col(batch, "chatroom");
    let chatroom_sender: Option<&StringArray> = col(batch, "chatroom_sender");
    let content: Option<&StringArray> = col(batch, "content");
    let source: Option<&StringArray> = col(batch, "source");
    let guid: Option<&StringArray> = col(batch, "guid");
    let msg_type: Option<&Int32Array> = col(batch, "msg_type");
    let notify_type: Option<&Int64Array> = col(batch, "notify_type");
    let is_chatroom: Option<&Int8Array> = col(batch, "is_chatroom_msg");
    let create_time: Option<&TimestampSecondArray> = col(batch, "create_time");
    let ingestion_time: Option<&TimestampSecondArray> = col(batch, "ingestion_time");

    let mut out = Vec::with_capacity(rows);
    for i in 0..rows {
        out.push(CanonicalMessage {
            msg_id: get_str(msg_id, i),
            from_user: get_str(from_user, i),
            to_user: get_str(to_user, i),
            chatroom: get_str(chatroom, i),
            chatroom_sender: get_str(chatroom_sender, i),
            msg_type: msg_type.filter(|c| !c.is_null(i)).map(|c| c.value(i)).unwrap_or(0),
            create_time: create_time
                .filter(|c| !c.is_null(i))
                .map(|c| c.value(i))
                .unwrap_or(0),
            is_chatroom_msg: is_chatroom
                .filter(|c| !c.is_null(i))
                .map(|c| c.value(i) != 0)
                .unwrap_or(false),
            content: get_str(content, i),
            source: get_str(source, i),
            guid: get_str(guid, i),
            notify_type: notify_type
                .filter(|c| !c.is_null(i))
                .map(|c| c.value(i))
                .unwrap_or(0),
            ingestion_time: ingestion_time
                .filter(|c| !c.is_null(i))
                .map(|c| c.value(i))
                .unwrap_or(0),
        });
    }
    Ok(out)
}

/// Decode a contact-sync batch.
pub fn batch_to_contacts(batch: &RecordBatch) -> Result<Vec<ContactRecord>> {
    fn col<'a, A: 'static>(batch: &'a RecordBatch, name: &str) -> Option<&'a A> {
        batch
            .column_by_name(name)
            .and_then(|c| c.as_any().downcast_ref::<A>())
    }
    fn get_str(col: Option<&StringArray>, i: usize) -> String {
        col.filter(|c| !c.is_null(i))
            .map(|c| c.value(i).to_string())
            .unwrap_or_default()
    }

    let username: Option<&StringArray> = col(batch, "username");
    let nickname: Option<&StringArray> = col(batch, "nickname");
    let remark: Option<&StringArray> = col(batch, "remark");
    let avatar: Option<&StringArray> = col(batch, "avatar");
    let contact_type: Option<&StringArray> = col(batch, "contact_type");
    let ingestion_time: Option<&TimestampSecondArray> = col(batch, "ingestion_time");

    let mut out = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        out.push(ContactRecord {
            username: get_str(username, i),
            nickname: get_str(nickname, i),
            remark: get_str(remark, i),
            avatar: get_str(avatar, i),
            contact_type: get_str(contact_type, i),
            ingestion_time: ingestion_time
                .filter(|c| !c.is_null(i))
                .map(|c| c.value(i))
                .unwrap_or(0),
        });
    }
    Ok(out)
}

/// Read only the msg_id column of a file. Used to seed the dedup index.
pub fn read_msg_ids(path: &Path) -> Result<Vec<String>> {
    let reader = ColumnarReader::open(path, Some(&["msg_id"]), None)?;
    let mut ids = Vec::new();
    for batch in reader {
        let batch = batch?;
        let col: &StringArray = batch
            .column(0)
            .as_any()
            .downcast_ref()
            .ok_or_else(|| LakeError::Schema("msg_id column is not a string".to_string()))?;
        ids.extend((0..col.len()).map(|i| col.value(i).to_string()));
    }
    Ok(ids)
}

/// Columnar data files in a directory: `.col` extension, no dot-prefixed
/// names, sorted for deterministic scans.
pub fn list_columnar_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(classify_io(e, "list partition directory")),
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) == Some(COLUMNAR_EXT) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(msg_id: &str, create_time: i64) -> CanonicalMessage {
        CanonicalMessage {
            msg_id: msg_id.to_string(),
            from_user: "u1".to_string(),
            to_user: "filehelper".to_string(),
            chatroom: "room@chat".to_string(),
            chatroom_sender: "u1".to_string(),
            msg_type: 1,
            create_time,
            is_chatroom_msg: true,
            content: "hello".to_string(),
            source: "7".to_string(),
            guid: "g-1".to_string(),
            notify_type: 100,
            ingestion_time: create_time + 60,
        }
    }

    #[test]
    fn write_then_read_round_trips_field_values() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("part-0.col");
        let msgs = vec![sample("A", 1_769_130_000), sample("B", 1_769_130_100)];
        let written = write_messages(&path, &msgs, "snappy").unwrap();
        assert_eq!(written.rows, 2);
        assert_eq!(written.min_create_time, 1_769_130_000);
        assert_eq!(written.max_create_time, 1_769_130_100);

        let reader = ColumnarReader::open(&path, None, None).unwrap();
        let mut read_back = Vec::new();
        for batch in reader {
            read_back.extend(batch_to_messages(&batch.unwrap()).unwrap());
        }
        assert_eq!(read_back, msgs);
    }

    #[test]
    fn projection_reads_subset() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("part-0.col");
        write_messages(&path, &[sample("A", 100)], "snappy").unwrap();

        let reader = ColumnarReader::open(&path, Some(&["msg_id", "content"]), None).unwrap();
        let batch = reader.into_iter().next().unwrap().unwrap();
        assert_eq!(batch.num_columns(), 2);
        let decoded = batch_to_messages(&batch).unwrap();
        assert_eq!(decoded[0].msg_id, "A");
        assert_eq!(decoded[0].content, "hello");
        // Unprojected columns decode as defaults.
        assert_eq!(decoded[0].from_user, "");
    }

    #[test]
    fn zstd_codec_accepted() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("part-z.col");
        write_messages(&path, &[sample("A", 1)], "zstd").unwrap();
        assert_eq!(read_msg_ids(&path).unwrap(), vec!["A"]);
    }

    #[test]
    fn unknown_codec_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("part-x.col");
        assert!(write_messages(&path, &[sample("A", 1)], "lzma").is_err());
    }

    #[test]
    fn row_group_pruning_excludes_disjoint_range() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("part-0.col");
        write_messages(&path, &[sample("A", 1000), sample("B", 2000)], "snappy").unwrap();

        // Disjoint range: the single row group's stats exclude it entirely.
        let reader = ColumnarReader::open(&path, None, Some((9_000, 10_000))).unwrap();
        let rows: usize = reader
            .map(|b| b.unwrap().num_rows())
            .sum();
        assert_eq!(rows, 0);
    }

    #[test]
    fn dotfiles_and_foreign_extensions_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(".hidden.col"), b"x").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), b"x").unwrap();
        let good = tmp.path().join("part-1.col");
        write_messages(&good, &[sample("A", 1)], "snappy").unwrap();

        let files = list_columnar_files(tmp.path()).unwrap();
        assert_eq!(files, vec![good]);
    }

    #[test]
    fn truncated_file_fails_with_columnar_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("part-t.col");
        write_messages(&path, &[sample("A", 1)], "snappy").unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        assert!(ColumnarReader::open(&path, None, None).is_err());
    }
}
