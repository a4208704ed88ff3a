//! Merging live events into collections the UI already holds.

use serde::{Deserialize, Serialize};

use crate::events::{CorrelationKey, JudgeEvent};

mod badges;
mod judge;

pub use badges::{MessageActivity, NotificationEntry, NotificationFeed};
pub use judge::{CollectionSource, JudgeReconciler};

/// A locally held record a judge verdict can be merged into.
pub trait VerdictTarget: Clone + Send + 'static {
    fn correlation_key(&self) -> CorrelationKey;

    /// Overwrite only the fields the verdict carries.
    fn apply_verdict(&mut self, event: &JudgeEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Updated { index: usize },
    /// No visible entry carries the key; nothing changed.
    Unmatched,
}

/// Replaces the first entry whose key matches the event with a merged copy.
pub fn merge_verdict<T: VerdictTarget>(entries: &mut [T], event: &JudgeEvent) -> MergeOutcome {
    let Some(index) = entries
        .iter()
        .position(|entry| entry.correlation_key() == event.submission)
    else {
        return MergeOutcome::Unmatched;
    };
    let mut merged = entries[index].clone();
    merged.apply_verdict(event);
    entries[index] = merged;
    MergeOutcome::Updated { index }
}

/// One row of a submissions listing as returned by the REST API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionEntry {
    pub snowflake_id: CorrelationKey,
    #[serde(default)]
    pub problem_name: Option<String>,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    pub status: String,
    #[serde(default)]
    pub time: Option<u64>,
    #[serde(default)]
    pub memory: Option<u64>,
    #[serde(default)]
    pub create_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_info: Option<String>,
}

impl VerdictTarget for SubmissionEntry {
    fn correlation_key(&self) -> CorrelationKey {
        self.snowflake_id.clone()
    }

    fn apply_verdict(&mut self, event: &JudgeEvent) {
        self.status = event.status.clone();
        if event.time.is_some() {
            self.time = event.time;
        }
        if event.memory.is_some() {
            self.memory = event.memory;
        }
        if event.error_info.is_some() {
            self.error_info = event.error_info.clone();
        }
    }
}
