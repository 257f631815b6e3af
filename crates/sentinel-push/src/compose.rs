//! Task-run notifications: turn a finished run into a push for its owner.

use sentinel_core::types::{TaskRunId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::dispatcher::{DeliveryReport, PushDispatcher};
use crate::payload::PushPayload;

const MAX_TITLE_CHARS: usize = 120;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Failed { error: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRunNotice {
    pub task_run_id: TaskRunId,
    pub user_id: UserId,
    pub outcome: RunOutcome,
}

/// Resolves a run's human-readable title, typically the task prompt.
pub trait RunSummaryLookup: Send + Sync {
    fn run_title(&self, task_run_id: &TaskRunId) -> Option<String>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticRunSummaries {
    titles: HashMap<TaskRunId, String>,
}

impl StaticRunSummaries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, task_run_id: TaskRunId, title: impl Into<String>) {
        self.titles.insert(task_run_id, title.into());
    }
}

impl RunSummaryLookup for StaticRunSummaries {
    fn run_title(&self, task_run_id: &TaskRunId) -> Option<String> {
        self.titles.get(task_run_id).cloned()
    }
}

pub fn compose_run_payload(notice: &TaskRunNotice, run_title: Option<&str>) -> PushPayload {
    let summary = run_title
        .map(str::trim)
        .filter(|title| !title.is_empty())
        .map(truncate_title);

    let (title, body, kind) = match &notice.outcome {
        RunOutcome::Completed => (
            "Task completed",
            summary.unwrap_or_else(|| "Your task run has finished.".to_string()),
            "task_run_completed",
        ),
        RunOutcome::Failed { error } => {
            let body = match (summary, error.as_deref().map(str::trim)) {
                (Some(summary), Some(error)) if !error.is_empty() => {
                    format!("{summary}: {error}")
                }
                (Some(summary), _) => summary,
                (None, Some(error)) if !error.is_empty() => error.to_string(),
                (None, _) => "Your task run failed.".to_string(),
            };
            ("Task failed", body, "task_run_failed")
        }
    };

    PushPayload::new(title, body)
        .with_data("type", kind)
        .with_data("taskRunId", notice.task_run_id.as_str())
}

fn truncate_title(title: &str) -> String {
    if title.chars().count() <= MAX_TITLE_CHARS {
        return title.to_string();
    }
    let mut out: String = title.chars().take(MAX_TITLE_CHARS - 1).collect();
    out.push('…');
    out
}

impl PushDispatcher {
    pub async fn notify_task_run(
        &self,
        notice: &TaskRunNotice,
        lookup: &dyn RunSummaryLookup,
    ) -> DeliveryReport {
        let title = lookup.run_title(&notice.task_run_id);
        let payload = compose_run_payload(notice, title.as_deref());
        self.send_to_user(&notice.user_id, &payload).await
    }
}
