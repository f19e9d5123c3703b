use rusqlite::{Connection, Result};

/// Initialise metadata tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    create_runs_table(conn)?;
    create_run_topics_table(conn)?;
    create_partitions_table(conn)?;
    create_schema_versions_table(conn)?;
    create_lineage_table(conn)?;
    create_checkpoints_table(conn)?;
    Ok(())
}

/// Mirror of the per-source checkpoint files, for operator queries. The
/// files in the checkpoint directory remain the source of truth — they
/// carry the atomic-publish guarantee the engine recovers from.
fn create_checkpoints_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS checkpoints (
            source_path   TEXT PRIMARY KEY,
            offset        INTEGER NOT NULL,
            last_key      TEXT,
            record_count  INTEGER NOT NULL,
            status        TEXT NOT NULL,
            error         TEXT,
            source_hash   TEXT,
            updated_at    TEXT NOT NULL
        );",
    )
}

fn create_runs_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS runs (
            id              TEXT PRIMARY KEY,
            chatroom        TEXT NOT NULL,
            date_start      TEXT NOT NULL,
            date_end        TEXT NOT NULL,
            status          TEXT NOT NULL,
            error           TEXT,
            batches_total   INTEGER NOT NULL DEFAULT 0,
            batches_failed  INTEGER NOT NULL DEFAULT 0,
            message_count   INTEGER NOT NULL DEFAULT 0,
            topic_count     INTEGER NOT NULL DEFAULT 0,
            started_at      TEXT NOT NULL,
            finished_at     TEXT,
            updated_at      TEXT NOT NULL,
            UNIQUE(chatroom, date_start, date_end)
        );
        CREATE INDEX IF NOT EXISTS idx_runs_chatroom
            ON runs(chatroom, date_start);",
    )
}

fn create_run_topics_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS run_topics (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id        TEXT NOT NULL,
            chatroom      TEXT NOT NULL,
            date_start    TEXT NOT NULL,
            date_end      TEXT NOT NULL,
            title         TEXT NOT NULL,
            summary_text  TEXT NOT NULL,
            keywords      TEXT NOT NULL,
            participants  TEXT NOT NULL,
            message_ids   TEXT NOT NULL,
            confidence    REAL NOT NULL,
            time_range    TEXT NOT NULL,
            notes         TEXT NOT NULL DEFAULT '',
            created_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_topics_run
            ON run_topics(run_id);
        CREATE INDEX IF NOT EXISTS idx_topics_chatroom
            ON run_topics(chatroom, date_start);",
    )
}

/// Per-partition statistics, a cache that saves directory scans.
fn create_partitions_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS partitions (
            dataset      TEXT NOT NULL,
            year         INTEGER NOT NULL,
            month        INTEGER NOT NULL,
            day          INTEGER NOT NULL,
            file_count   INTEGER NOT NULL DEFAULT 0,
            row_count    INTEGER NOT NULL DEFAULT 0,
            total_bytes  INTEGER NOT NULL DEFAULT 0,
            min_ts       INTEGER,
            max_ts       INTEGER,
            updated_at   TEXT NOT NULL,
            PRIMARY KEY (dataset, year, month, day)
        );",
    )
}

fn create_schema_versions_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_versions (
            name        TEXT NOT NULL,
            version     INTEGER NOT NULL,
            schema_json TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            UNIQUE(name, version)
        );",
    )
}

/// Append-only source→target trace of every compaction publish.
fn create_lineage_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS lineage (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            source_path   TEXT NOT NULL,
            dataset       TEXT NOT NULL,
            partition_day TEXT NOT NULL,
            record_count  INTEGER NOT NULL,
            created_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_lineage_source
            ON lineage(source_path);",
    )
}
