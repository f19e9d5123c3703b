//! Per-chatroom, per-date-range run coordination.
//!
//! Individual batch failures degrade a run to `completed-partial`; only
//! infrastructure failures (unreadable lake, metadata store down) abort it.
//! Cancellation is checked between batches — an in-flight model call runs to
//! its own timeout.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use chatlake_core::types::{DateRange, RunStatus, TopicSummary};
use chatlake_lake::query::{LakeQuery, MessageFilters};
use chatlake_meta::MetadataStore;

use crate::batch::pack;
use crate::client::TopicAnalyst;
use crate::error::{AnalysisError, Result};
use crate::merge::MergeStrategy;
use crate::normalize::normalize;
use crate::types::Topic;

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub topics: Vec<TopicSummary>,
    pub batches_total: u32,
    pub batches_failed: u32,
    pub message_count: u64,
}

pub struct AnalysisOrchestrator {
    query: LakeQuery,
    meta: Arc<MetadataStore>,
    analyst: TopicAnalyst,
    merger: Box<dyn MergeStrategy>,
    max_tokens_per_batch: usize,
    /// When set, merged summaries are also published as a JSON file here.
    results_dir: Option<PathBuf>,
}

impl AnalysisOrchestrator {
    pub fn new(
        query: LakeQuery,
        meta: Arc<MetadataStore>,
        analyst: TopicAnalyst,
        merger: Box<dyn MergeStrategy>,
        max_tokens_per_batch: usize,
        results_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            query,
            meta,
            analyst,
            merger,
            max_tokens_per_batch,
            results_dir,
        }
    }

    /// Run one analysis. Re-running the same (chatroom, range) overwrites
    /// the stored outcome and topics.
    pub async fn run(
        &self,
        chatroom: &str,
        range: DateRange,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        let run = self.meta.begin_run(chatroom, range)?;
        info!(run_id = %run.id, chatroom, range = %range, "analysis run starting");

        let mut messages: Vec<_> = match self.query.query_messages(
            range,
            MessageFilters {
                chatroom: Some(chatroom.to_string()),
                ..Default::default()
            },
            None,
        ) {
            Ok(scan) => scan.collect(),
            Err(e) => {
                self.meta.finish_run(
                    &run.id,
                    RunStatus::Failed,
                    Some(&e.to_string()),
                    0,
                    0,
                    0,
                    0,
                )?;
                return Err(AnalysisError::Storage(e));
            }
        };
        messages.sort_by(|a, b| {
            a.create_time
                .cmp(&b.create_time)
                .then_with(|| a.msg_id.cmp(&b.msg_id))
        });
        let message_count = messages.len() as u64;

        if messages.is_empty() {
            self.meta.replace_topics(&run.id, &[])?;
            self.meta
                .finish_run(&run.id, RunStatus::Completed, None, 0, 0, 0, 0)?;
            info!(run_id = %run.id, chatroom, "no messages in range; empty result recorded");
            return Ok(RunOutcome {
                run_id: run.id,
                status: RunStatus::Completed,
                topics: Vec::new(),
                batches_total: 0,
                batches_failed: 0,
                message_count: 0,
            });
        }

        let normalized: Vec<_> = messages.iter().map(normalize).collect();
        let batches = pack(normalized, self.max_tokens_per_batch);
        let batches_total = batches.len() as u32;

        let mut batch_topics: Vec<Vec<Topic>> = Vec::new();
        let mut batches_failed = 0u32;
        let mut first_error: Option<String> = None;
        for (index, batch) in batches.iter().enumerate() {
            if cancel.is_cancelled() {
                self.meta.finish_run(
                    &run.id,
                    RunStatus::Failed,
                    Some("cancelled"),
                    batches_total,
                    batches_failed,
                    message_count,
                    0,
                )?;
                return Err(AnalysisError::Cancelled);
            }
            match self.analyst.analyze_batch(batch).await {
                Ok(topics) => batch_topics.push(topics),
                Err(e) => {
                    warn!(run_id = %run.id, batch = index, error = %e, "batch analysis failed");
                    batches_failed += 1;
                    first_error.get_or_insert_with(|| format!("batch {index}: {e}"));
                }
            }
        }

        let merged = self.merger.merge(batch_topics);
        let topics: Vec<TopicSummary> = merged
            .into_iter()
            .map(|t| TopicSummary {
                chatroom: chatroom.to_string(),
                date_range: range,
                title: t.title,
                summary_text: t.summary,
                keywords: t.keywords,
                participants: t.participants,
                message_ids: t.message_ids,
                confidence: t.confidence,
                time_range: t.time_range,
                notes: t.notes,
            })
            .collect();

        self.meta.replace_topics(&run.id, &topics)?;
        if let Some(dir) = &self.results_dir {
            self.write_results_file(dir, chatroom, range, &topics)?;
        }

        let status = if batches_failed == 0 {
            RunStatus::Completed
        } else if batches_failed < batches_total {
            RunStatus::CompletedPartial
        } else {
            RunStatus::Failed
        };
        self.meta.finish_run(
            &run.id,
            status,
            first_error.as_deref(),
            batches_total,
            batches_failed,
            message_count,
            topics.len() as u32,
        )?;

        info!(
            run_id = %run.id,
            status = %status,
            topics = topics.len(),
            batches_failed,
            "analysis run finished"
        );
        Ok(RunOutcome {
            run_id: run.id,
            status,
            topics,
            batches_total,
            batches_failed,
            message_count,
        })
    }

    fn write_results_file(
        &self,
        dir: &std::path::Path,
        chatroom: &str,
        range: DateRange,
        topics: &[TopicSummary],
    ) -> Result<()> {
        let safe_room: String = chatroom
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        let path = dir.join(format!("{safe_room}-{}_{}.json", range.start, range.end));
        let payload = serde_json::to_vec_pretty(topics)
            .map_err(|e| chatlake_lake::LakeError::Parse(format!("encode results: {e}")))?;
        chatlake_lake::atomic::publish_atomic(&payload, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::{RESULT_END, RESULT_START};
    use crate::provider::{ChatRequest, ChatResponse, LlmProvider};
    use async_trait::async_trait;
    use chatlake_core::types::CanonicalMessage;
    use chatlake_lake::columnar::write_messages;
    use chatlake_lake::partition::partition_dir;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 23).unwrap()
    }

    fn seed_lake(root: &std::path::Path, msgs: &[CanonicalMessage]) {
        let dir = partition_dir(root, day());
        std::fs::create_dir_all(&dir).unwrap();
        write_messages(&dir.join("part-0.col"), msgs, "snappy").unwrap();
    }

    fn msg(id: &str, minute: u32) -> CanonicalMessage {
        let create_time = day()
            .and_hms_opt(9, minute, 0)
            .unwrap()
            .and_utc()
            .timestamp();
        CanonicalMessage {
            msg_id: id.to_string(),
            from_user: "u1".to_string(),
            to_user: "u2".to_string(),
            chatroom: "room@chat".to_string(),
            chatroom_sender: "alice".to_string(),
            msg_type: 1,
            create_time,
            is_chatroom_msg: true,
            content: format!("message {id}"),
            source: "1".to_string(),
            guid: String::new(),
            notify_type: 0,
            ingestion_time: create_time,
        }
    }

    struct ScriptedProvider {
        calls: AtomicU32,
        script: Vec<std::result::Result<String, crate::error::LlmError>>,
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn send(&self, _req: &ChatRequest) -> std::result::Result<ChatResponse, crate::error::LlmError> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            match &self.script[i.min(self.script.len() - 1)] {
                Ok(content) => Ok(ChatResponse {
                    content: content.clone(),
                    tokens_in: 1,
                    tokens_out: 1,
                }),
                Err(crate::error::LlmError::Authentication(s)) => {
                    Err(crate::error::LlmError::Authentication(s.clone()))
                }
                Err(_) => Err(crate::error::LlmError::Unavailable("scripted".to_string())),
            }
        }
    }

    fn good_response(ids: &str) -> String {
        format!(
            "{RESULT_START}\n\
             title: thread\n\
             summary: A discussion thread covering the messages.\n\
             keywords: launch, plan\n\
             participants: alice\n\
             message_ids: {ids}\n\
             confidence: 0.9\n\
             time_range: 09:00-09:30\n\
             {RESULT_END}"
        )
    }

    fn orchestrator(
        root: &std::path::Path,
        meta: Arc<MetadataStore>,
        script: Vec<std::result::Result<String, crate::error::LlmError>>,
        max_tokens: usize,
        results_dir: Option<PathBuf>,
    ) -> AnalysisOrchestrator {
        let provider = Arc::new(ScriptedProvider {
            calls: AtomicU32::new(0),
            script,
        });
        AnalysisOrchestrator::new(
            LakeQuery::new(root),
            meta,
            TopicAnalyst::new(provider, "stub-model", 1),
            Box::new(crate::merge::KeywordOverlapMerger::default()),
            max_tokens,
            results_dir,
        )
    }

    #[tokio::test]
    async fn empty_day_records_empty_completed_run() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path()).unwrap();
        seed_lake(tmp.path(), &[msg("other", 0)]);
        let meta = Arc::new(MetadataStore::open_in_memory().unwrap());
        let orch = orchestrator(tmp.path(), meta.clone(), vec![], 8000, None);

        let outcome = orch
            .run("empty-room", DateRange::single(day()), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert!(outcome.topics.is_empty());
        assert_eq!(outcome.message_count, 0);

        let run = meta
            .get_run("empty-room", DateRange::single(day()))
            .unwrap()
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn happy_path_emits_topics_and_results_file() {
        let tmp = tempfile::tempdir().unwrap();
        seed_lake(tmp.path(), &[msg("m1", 0), msg("m2", 5)]);
        let meta = Arc::new(MetadataStore::open_in_memory().unwrap());
        let results = tmp.path().join("results");
        let orch = orchestrator(
            tmp.path(),
            meta.clone(),
            vec![Ok(good_response("m1, m2"))],
            8000,
            Some(results.clone()),
        );

        let outcome = orch
            .run("room@chat", DateRange::single(day()), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.topics.len(), 1);
        assert_eq!(outcome.topics[0].message_ids, vec!["m1", "m2"]);
        assert_eq!(outcome.message_count, 2);

        let stored = meta.topics_for_run(&outcome.run_id).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].chatroom, "room@chat");

        let file = results.join("room_chat-2026-01-23_2026-01-23.json");
        let written: Vec<TopicSummary> =
            serde_json::from_slice(&std::fs::read(file).unwrap()).unwrap();
        assert_eq!(written.len(), 1);
    }

    #[tokio::test]
    async fn all_batches_failing_marks_run_failed() {
        let tmp = tempfile::tempdir().unwrap();
        seed_lake(tmp.path(), &[msg("m1", 0)]);
        let meta = Arc::new(MetadataStore::open_in_memory().unwrap());
        let orch = orchestrator(
            tmp.path(),
            meta.clone(),
            vec![Err(crate::error::LlmError::Authentication("bad".to_string()))],
            8000,
            None,
        );

        let outcome = orch
            .run("room@chat", DateRange::single(day()), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.batches_failed, 1);
        assert!(outcome.topics.is_empty());

        let run = meta
            .get_run("room@chat", DateRange::single(day()))
            .unwrap()
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.unwrap().contains("batch 0"));
    }

    #[tokio::test]
    async fn one_failing_batch_degrades_to_partial() {
        let tmp = tempfile::tempdir().unwrap();
        // Long contents force one message per batch.
        let mut m1 = msg("m1", 0);
        m1.content = "alpha ".repeat(200);
        let mut m2 = msg("m2", 5);
        m2.content = "beta ".repeat(200);
        seed_lake(tmp.path(), &[m1, m2]);
        let meta = Arc::new(MetadataStore::open_in_memory().unwrap());
        let orch = orchestrator(
            tmp.path(),
            meta.clone(),
            vec![
                Err(crate::error::LlmError::Authentication("bad".to_string())),
                Ok(good_response("m2")),
            ],
            100,
            None,
        );

        let outcome = orch
            .run("room@chat", DateRange::single(day()), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.batches_total, 2);
        assert_eq!(outcome.batches_failed, 1);
        assert_eq!(outcome.status, RunStatus::CompletedPartial);
        assert_eq!(outcome.topics.len(), 1);
    }

    #[tokio::test]
    async fn cancellation_between_batches_fails_run() {
        let tmp = tempfile::tempdir().unwrap();
        seed_lake(tmp.path(), &[msg("m1", 0)]);
        let meta = Arc::new(MetadataStore::open_in_memory().unwrap());
        let orch = orchestrator(tmp.path(), meta.clone(), vec![Ok(good_response("m1"))], 8000, None);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = orch
            .run("room@chat", DateRange::single(day()), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::Cancelled));

        let run = meta
            .get_run("room@chat", DateRange::single(day()))
            .unwrap()
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn rerun_overwrites_previous_topics() {
        let tmp = tempfile::tempdir().unwrap();
        seed_lake(tmp.path(), &[msg("m1", 0)]);
        let meta = Arc::new(MetadataStore::open_in_memory().unwrap());

        let orch1 = orchestrator(tmp.path(), meta.clone(), vec![Ok(good_response("m1"))], 8000, None);
        let first = orch1
            .run("room@chat", DateRange::single(day()), &CancellationToken::new())
            .await
            .unwrap();

        let orch2 = orchestrator(tmp.path(), meta.clone(), vec![Ok(good_response("m1"))], 8000, None);
        let second = orch2
            .run("room@chat", DateRange::single(day()), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(first.run_id, second.run_id);
        assert_eq!(meta.topics_for_run(&second.run_id).unwrap().len(), 1);
    }
}
