use serde::{Deserialize, Serialize};

/// A resolved reply reference extracted from a message's embedded payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferMsg {
    /// Server id of the referenced message.
    pub svrid: String,
    pub refer_type: i32,
    /// Text excerpt of the referenced message.
    pub content: String,
    /// Display name of the referenced sender.
    pub displayname: String,
    /// Epoch seconds of the referenced message.
    pub createtime: i64,
    /// The replying message's own text (the payload's title element).
    pub title: String,
}

/// A message prepared for prompting: cleaned, enriched, and renderable as a
/// single display line.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedMessage {
    pub msg_id: String,
    pub sender: String,
    /// Local wall-clock "HH:MM" for display.
    pub time_display: String,
    /// Cleaned content, reply context already folded in.
    pub content: String,
    pub refer: Option<ReferMsg>,
    pub create_time: i64,
}

impl NormalizedMessage {
    /// The line the LLM sees: `[<msg_id>] <HH:MM> <sender>: <content>`.
    pub fn display_line(&self) -> String {
        format!(
            "[{}] {} {}: {}",
            self.msg_id, self.time_display, self.sender, self.content
        )
    }
}

/// One topic cluster as parsed from a model response, before cross-batch
/// merging and result emission.
#[derive(Debug, Clone, PartialEq)]
pub struct Topic {
    pub title: String,
    pub summary: String,
    pub keywords: Vec<String>,
    pub participants: Vec<String>,
    pub message_ids: Vec<String>,
    pub confidence: f32,
    /// "HH:MM-HH:MM".
    pub time_range: String,
    pub notes: String,
}
