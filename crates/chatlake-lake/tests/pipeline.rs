// End-to-end lake flow: webhook deliveries captured to a day-log, compacted
// into date partitions, and read back through the query surface.

use std::path::Path;
use std::time::Duration;

use chrono::NaiveDate;

use chatlake_core::types::{DateRange, RawDelivery};
use chatlake_lake::checkpoint::CheckpointStore;
use chatlake_lake::compact::Compactor;
use chatlake_lake::dedup::DedupSizing;
use chatlake_lake::query::{LakeQuery, MessageFilters};
use chatlake_lake::rawlog::DayLogWriter;

fn delivery(at: &str, body: &[u8]) -> RawDelivery {
    RawDelivery {
        received_at: at.parse().unwrap(),
        client_addr: "10.0.0.1".to_string(),
        headers: vec![("Content-Type".to_string(), "application/json".to_string())],
        body: body.to_vec(),
    }
}

fn message_body(msg_id: &str, create_time: i64, chatroom: &str) -> Vec<u8> {
    serde_json::json!({
        "msg_id": msg_id,
        "from_username": "u1",
        "to_username": "filehelper",
        "chatroom": chatroom,
        "chatroom_sender": "alice",
        "msg_type": 1,
        "create_time": create_time,
        "content": format!("hello from {msg_id}"),
        "is_chatroom_msg": if chatroom.is_empty() { 0 } else { 1 },
        "source": 7,
    })
    .to_string()
    .into_bytes()
}

fn compactor(root: &Path, checkpoints: &Path) -> Compactor {
    Compactor::new(
        root,
        CheckpointStore::new(checkpoints),
        10_000,
        "snappy",
        DedupSizing::default(),
        Duration::from_secs(1),
    )
}

#[test]
fn captured_deliveries_survive_to_query() {
    let tmp = tempfile::tempdir().unwrap();
    let raw_dir = tmp.path().join("raw");
    let lake_root = tmp.path().join("lake");
    let cp_dir = tmp.path().join("cp");

    // 2026-01-23T02:00:00Z and one message the next hour, plus binary junk
    // that must be captured but never compacted.
    let writer = DayLogWriter::new(&raw_dir, Duration::from_secs(5));
    writer
        .append(&delivery(
            "2026-01-23T02:00:00Z",
            &message_body("m1", 1_769_133_600, "room@chat"),
        ))
        .unwrap();
    writer
        .append(&delivery(
            "2026-01-23T03:00:00Z",
            &message_body("m2", 1_769_137_200, "room@chat"),
        ))
        .unwrap();
    writer
        .append(&delivery("2026-01-23T03:30:00Z", &[0xde, 0xad, 0xbe, 0xef]))
        .unwrap();
    assert_eq!(writer.health().message_count(), 3);

    let source = raw_dir.join("2026-01-23.jsonl");
    let stats = compactor(&lake_root, &cp_dir).compact(&source).unwrap();
    assert_eq!(stats.new_records, 2);
    assert_eq!(stats.unclassified, 1);

    let day = NaiveDate::from_ymd_opt(2026, 1, 23).unwrap();
    let rows: Vec<_> = LakeQuery::new(&lake_root)
        .query_messages(
            DateRange::single(day),
            MessageFilters {
                chatroom: Some("room@chat".to_string()),
                ..Default::default()
            },
            None,
        )
        .unwrap()
        .collect();
    assert_eq!(rows.len(), 2);
    let mut ids: Vec<&str> = rows.iter().map(|m| m.msg_id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["m1", "m2"]);
    assert!(rows.iter().all(|m| m.source == "7"));
}

#[test]
fn compaction_is_idempotent_over_the_same_log() {
    let tmp = tempfile::tempdir().unwrap();
    let raw_dir = tmp.path().join("raw");
    let lake_root = tmp.path().join("lake");
    let cp_dir = tmp.path().join("cp");

    let writer = DayLogWriter::new(&raw_dir, Duration::from_secs(5));
    for (id, offset) in [("a", 0), ("b", 60)] {
        writer
            .append(&delivery(
                "2026-01-23T02:00:00Z",
                &message_body(id, 1_769_133_600 + offset, ""),
            ))
            .unwrap();
    }

    let source = raw_dir.join("2026-01-23.jsonl");
    let c = compactor(&lake_root, &cp_dir);
    assert_eq!(c.compact(&source).unwrap().new_records, 2);
    assert_eq!(c.compact(&source).unwrap().new_records, 0);

    let day = NaiveDate::from_ymd_opt(2026, 1, 23).unwrap();
    let rows: Vec<_> = LakeQuery::new(&lake_root)
        .query_messages(DateRange::single(day), MessageFilters::default(), None)
        .unwrap()
        .collect();
    assert_eq!(rows.len(), 2);
}

#[test]
fn messages_spanning_midnight_land_in_their_own_partitions() {
    let tmp = tempfile::tempdir().unwrap();
    let raw_dir = tmp.path().join("raw");
    let lake_root = tmp.path().join("lake");
    let cp_dir = tmp.path().join("cp");

    let writer = DayLogWriter::new(&raw_dir, Duration::from_secs(5));
    // 23:59:59 on the 22nd and exactly midnight on the 23rd.
    writer
        .append(&delivery(
            "2026-01-23T00:00:10Z",
            &message_body("late", 1_769_126_399, ""),
        ))
        .unwrap();
    writer
        .append(&delivery(
            "2026-01-23T00:00:11Z",
            &message_body("midnight", 1_769_126_400, ""),
        ))
        .unwrap();

    let source = raw_dir.join("2026-01-23.jsonl");
    compactor(&lake_root, &cp_dir).compact(&source).unwrap();

    let q = LakeQuery::new(&lake_root);
    let on_22: Vec<_> = q
        .query_messages(
            DateRange::single(NaiveDate::from_ymd_opt(2026, 1, 22).unwrap()),
            MessageFilters::default(),
            None,
        )
        .unwrap()
        .collect();
    let on_23: Vec<_> = q
        .query_messages(
            DateRange::single(NaiveDate::from_ymd_opt(2026, 1, 23).unwrap()),
            MessageFilters::default(),
            None,
        )
        .unwrap()
        .collect();

    assert_eq!(on_22.len(), 1);
    assert_eq!(on_22[0].msg_id, "late");
    assert_eq!(on_23.len(), 1);
    assert_eq!(on_23[0].msg_id, "midnight");
}
