//! Daily job driver: compact finished day-logs, refresh the metadata
//! caches, apply raw-log retention, and (optionally) analyse the configured
//! chatrooms for the previous day.
//!
//! The loop ticks once a minute and fires when the configured UTC hour
//! arrives, at most once per calendar day. Compaction and retention are
//! blocking lake work and run under `spawn_blocking`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Timelike, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use chatlake_core::config::ChatlakeConfig;
use chatlake_core::types::{CheckpointStatus, DateRange};
use chatlake_lake::checkpoint::{content_hash, CheckpointStore};
use chatlake_lake::compact::{CompactionStats, Compactor, Dataset};
use chatlake_lake::dedup::DedupSizing;
use chatlake_lake::query::LakeQuery;
use chatlake_lake::rawlog::{day_log_date, DayLogWriter};
use chatlake_lake::schema::{CANONICAL_MESSAGES, CONTACTS};
use chatlake_meta::MetadataStore;

use chatlake_analysis::client::TopicAnalyst;
use chatlake_analysis::merge::KeywordOverlapMerger;
use chatlake_analysis::openai::OpenAiProvider;
use chatlake_analysis::orchestrator::AnalysisOrchestrator;

pub struct DailyJobs {
    config: ChatlakeConfig,
    writer: Arc<DayLogWriter>,
    meta: Arc<MetadataStore>,
}

impl DailyJobs {
    pub fn new(config: ChatlakeConfig, writer: Arc<DayLogWriter>, meta: Arc<MetadataStore>) -> Self {
        Self {
            config,
            writer,
            meta,
        }
    }

    /// Minute-resolution scheduler loop. Fires at the configured UTC hour,
    /// once per day, until shutdown.
    pub async fn run_loop(self, shutdown: CancellationToken) {
        info!(hour = self.config.jobs.compact_hour_utc, "daily job loop started");
        let mut last_fired: Option<NaiveDate> = None;
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = Utc::now();
                    if is_due(now.hour(), now.date_naive(), self.config.jobs.compact_hour_utc, last_fired) {
                        last_fired = Some(now.date_naive());
                        if let Err(e) = self.run_once(&shutdown).await {
                            error!(error = %e, "daily job failed");
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("daily job loop stopped");
                    return;
                }
            }
        }
    }

    /// One full pass: compact every finished day-log, record lineage and
    /// partition statistics, apply retention, run configured analyses.
    pub async fn run_once(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let today = Utc::now().date_naive();
        let sources = self.finished_day_logs(today)?;
        info!(sources = sources.len(), "daily job: compacting finished day-logs");

        for source in sources {
            let compactor = self.build_compactor();
            let path = source.clone();
            let stats = tokio::task::spawn_blocking(move || compactor.compact(&path)).await?;
            match stats {
                Ok(stats) => self.record_compaction(&source, &stats),
                Err(e) => {
                    // One bad source must not stall retention or the rest of
                    // the queue; the checkpoint makes a retry safe.
                    warn!(source = %source.display(), error = %e, "compaction failed");
                }
            }
            self.mirror_checkpoint(&source);
        }

        self.apply_retention().await?;

        if !self.config.jobs.chatrooms.is_empty() {
            self.run_analyses(today.pred_opt().unwrap_or(today), cancel).await;
        }
        Ok(())
    }

    /// Day-logs whose date has passed. Today's log is still being written.
    fn finished_day_logs(&self, today: NaiveDate) -> anyhow::Result<Vec<PathBuf>> {
        let dir = Path::new(&self.config.raw_log_dir);
        let mut sources = Vec::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(sources),
            Err(e) => return Err(e.into()),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if day_log_date(&path).is_some_and(|d| d < today) {
                sources.push(path);
            }
        }
        sources.sort();
        Ok(sources)
    }

    fn build_compactor(&self) -> Compactor {
        Compactor::new(
            &self.config.partition_root,
            CheckpointStore::new(&self.config.checkpoint_dir),
            self.config.batch_size,
            &self.config.compression,
            DedupSizing {
                bloom_threshold: self.config.dedup.bloom_threshold,
                bloom_fp_rate: self.config.dedup.bloom_fp_rate,
            },
            Duration::from_secs(self.config.locks.compact_timeout_secs),
        )
    }

    fn record_compaction(&self, source: &Path, stats: &CompactionStats) {
        for write in &stats.writes {
            let dataset = match write.dataset {
                Dataset::Messages => CANONICAL_MESSAGES,
                Dataset::Contacts => CONTACTS,
            };
            if let Err(e) = self.meta.record_partition_write(
                dataset,
                write.date,
                write.rows as u64,
                write.bytes,
                write.min_create_time,
                write.max_create_time,
            ) {
                warn!(error = %e, "partition cache update failed");
            }
            if let Err(e) = self.meta.record_lineage(
                &source.to_string_lossy(),
                dataset,
                write.date,
                write.rows as u64,
            ) {
                warn!(error = %e, "lineage record failed");
            }
        }
        if stats.new_records > 0 || stats.duplicates > 0 {
            info!(
                source = %source.display(),
                new_records = stats.new_records,
                duplicates = stats.duplicates,
                "compaction recorded"
            );
        }
    }

    /// Reflect the on-disk checkpoint into the metadata store so operators
    /// can query progress without reading the checkpoint directory.
    fn mirror_checkpoint(&self, source: &Path) {
        let checkpoints = CheckpointStore::new(&self.config.checkpoint_dir);
        match checkpoints.load(source) {
            Ok(Some(cp)) => {
                if let Err(e) = self.meta.mirror_checkpoint(&cp) {
                    warn!(error = %e, "checkpoint mirror failed");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(source = %source.display(), error = %e, "checkpoint unreadable"),
        }
    }

    async fn apply_retention(&self) -> anyhow::Result<()> {
        let writer = self.writer.clone();
        let retention_days = self.config.retention_days_raw;
        let require = self.config.retention_requires_compaction;
        let checkpoint_dir = self.config.checkpoint_dir.clone();

        let deleted = tokio::task::spawn_blocking(move || {
            let checkpoints = CheckpointStore::new(&checkpoint_dir);
            let is_compacted = |path: &Path| -> bool {
                let Ok(Some(cp)) = checkpoints.load(path) else {
                    return false;
                };
                cp.status == CheckpointStatus::Completed
                    && content_hash(path).ok().as_deref() == cp.source_hash.as_deref()
            };
            writer.apply_retention(retention_days, is_compacted, require)
        })
        .await??;

        if !deleted.is_empty() {
            info!(count = deleted.len(), "expired day-logs removed");
        }
        Ok(())
    }

    async fn run_analyses(&self, day: NaiveDate, cancel: &CancellationToken) {
        let llm = &self.config.llm;
        if llm.api_key.is_empty() {
            warn!("llm.api_key not set; skipping scheduled analysis");
            return;
        }

        let provider = Arc::new(OpenAiProvider::new(
            llm.api_key.clone(),
            llm.api_base.clone(),
            Duration::from_secs(llm.request_timeout_seconds),
        ));
        let analyst = TopicAnalyst::new(provider, llm.model.clone(), llm.max_attempts);
        let merger = KeywordOverlapMerger::new(
            self.config.analysis.merge_threshold,
            self.config.analysis.time_bonus,
        );
        let orchestrator = AnalysisOrchestrator::new(
            LakeQuery::new(&self.config.partition_root),
            self.meta.clone(),
            analyst,
            Box::new(merger),
            llm.max_tokens_per_batch,
            self.config.analysis.results_dir.as_ref().map(PathBuf::from),
        );

        for chatroom in &self.config.jobs.chatrooms {
            match orchestrator
                .run(chatroom, DateRange::single(day), cancel)
                .await
            {
                Ok(outcome) => info!(
                    chatroom,
                    status = %outcome.status,
                    topics = outcome.topics.len(),
                    "scheduled analysis finished"
                ),
                Err(e) => warn!(chatroom, error = %e, "scheduled analysis failed"),
            }
        }
    }
}

/// Fire when the clock is inside the configured hour and we have not fired
/// today.
fn is_due(hour_now: u32, today: NaiveDate, fire_hour: u32, last_fired: Option<NaiveDate>) -> bool {
    hour_now == fire_hour && last_fired != Some(today)
}
