//! Chat message model: [`Message`], its [`Part`] variants, and [`Metadata`]
//! (spec §3 "Message").

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Lifecycle of a `dynamic-tool` part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolPartState {
    InputAvailable,
    OutputAvailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Part {
    Text { text: String },
    Reasoning { text: String },
    File { media_type: String, url: String },
    DynamicTool {
        tool_call_id: String,
        tool_name: String,
        state: ToolPartState,
        input: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<serde_json::Value>,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    /// Part with non-empty trimmed text content (§4.2 step 4 "commit-worthy").
    pub fn has_nonempty_text(&self) -> bool {
        matches!(self, Part::Text { text } if !text.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MuxEventType {
    Normal,
    CompactionRequest,
    CompactionSummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionRequestSource {
    User,
    Idle,
    OnSend,
    MidStream,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PendingFollowUp {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MuxMetadata {
    #[serde(rename = "type")]
    pub kind: Option<MuxEventType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<CompactionRequestSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_follow_up: Option<PendingFollowUp>,
}

/// `compacted` ∈ {absent, true, "user", "idle"}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactedBy {
    #[serde(rename = "true")]
    Legacy,
    User,
    Idle,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_input_tokens: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metadata {
    /// Non-negative, strictly increasing within a workspace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub partial: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacted: Option<CompactedBy>,
    #[serde(default)]
    pub compaction_boundary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compaction_epoch: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mux_metadata: Option<MuxMetadata>,
    #[serde(default)]
    pub synthetic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_at_mention_snapshot: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttft_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_message_tokens: Option<u64>,
    /// Transient UI-only fields, stripped on commit (§4.2 step 1).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

impl Metadata {
    /// Returns `true` iff this message is a well-formed boundary per §3:
    /// `compactionBoundary` requires `compacted` set and a positive epoch.
    /// Malformed boundaries are self-healed by treating them as non-boundaries.
    pub fn is_valid_boundary(&self) -> bool {
        self.compaction_boundary
            && self.compacted.is_some()
            && self.compaction_epoch.is_some_and(|e| e > 0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub parts: Vec<Part>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Message {
    pub fn new(id: impl Into<String>, role: Role, parts: Vec<Part>) -> Self {
        Self {
            id: id.into(),
            role,
            parts,
            metadata: Metadata::default(),
        }
    }

    /// §4.2 step 4: would this message, if it were a partial, be worth committing?
    pub fn is_commit_worthy(&self) -> bool {
        self.parts.iter().any(|p| match p {
            Part::Text { .. } => p.has_nonempty_text(),
            Part::Reasoning { .. } => true,
            Part::File { .. } => true,
            Part::DynamicTool { state, .. } => *state == ToolPartState::OutputAvailable,
        })
    }

    /// Strips `input-available` tool parts before building a provider request
    /// (§3 invariant: incomplete tool calls never reach the model).
    pub fn provider_visible_parts(&self) -> Vec<&Part> {
        self.parts
            .iter()
            .filter(|p| !matches!(p, Part::DynamicTool { state: ToolPartState::InputAvailable, .. }))
            .collect()
    }
}
