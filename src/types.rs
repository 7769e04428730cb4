//! Core type definitions for catalog normalization and classification

use crate::error::ErrorCategory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

pub type EntityId = i64;
pub type SessionId = u64;
pub type TaskId = u64;
pub type GroupId = u64;

/// Catalog record as exported from the source ERP
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub measures: BTreeMap<String, f64>,
    /// Existing taxonomy assignments keyed by taxonomy
    #[serde(default)]
    pub assignments: BTreeMap<Taxonomy, String>,
}

impl EntityRecord {
    pub fn new(id: EntityId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            code: None,
            category: None,
            attributes: BTreeMap::new(),
            measures: BTreeMap::new(),
            assignments: BTreeMap::new(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_measure(mut self, key: impl Into<String>, value: f64) -> Self {
        self.measures.insert(key.into(), value);
        self
    }

    pub fn with_assignment(mut self, taxonomy: Taxonomy, code: impl Into<String>) -> Self {
        self.assignments.insert(taxonomy, code.into());
        self
    }

    /// Number of populated optional fields, used to pick a group representative
    pub fn populated_fields(&self) -> usize {
        usize::from(self.code.is_some())
            + usize::from(self.category.is_some())
            + self.attributes.len()
            + self.measures.len()
            + self.assignments.len()
    }
}

// ---------------------------------------------------------------------------
// Normalization sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    PatternsApplied,
    AiApplied,
    Categorized,
    Completed,
    Failed,
    Reverted,
}

/// Ordered pipeline stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Patterns,
    AiCorrection,
    Categorization,
    Completion,
}

impl Stage {
    pub const ORDER: [Stage; 4] = [
        Stage::Patterns,
        Stage::AiCorrection,
        Stage::Categorization,
        Stage::Completion,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Patterns => "patterns",
            Stage::AiCorrection => "ai_correction",
            Stage::Categorization => "categorization",
            Stage::Completion => "completion",
        }
    }

    pub fn from_name(name: &str) -> Option<Stage> {
        Stage::ORDER.iter().copied().find(|s| s.name() == name)
    }

    /// Zero-based position in the pipeline
    pub fn position(&self) -> usize {
        match self {
            Stage::Patterns => 0,
            Stage::AiCorrection => 1,
            Stage::Categorization => 2,
            Stage::Completion => 3,
        }
    }

    /// Status reached once this stage succeeds
    pub fn status_after(&self) -> SessionStatus {
        match self {
            Stage::Patterns => SessionStatus::PatternsApplied,
            Stage::AiCorrection => SessionStatus::AiApplied,
            Stage::Categorization => SessionStatus::Categorized,
            Stage::Completion => SessionStatus::Completed,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Status corresponding to a cursor position (number of completed stages)
pub fn status_for_index(index: usize) -> SessionStatus {
    match index {
        0 => SessionStatus::Created,
        1 => SessionStatus::PatternsApplied,
        2 => SessionStatus::AiApplied,
        3 => SessionStatus::Categorized,
        _ => SessionStatus::Completed,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub category: ErrorCategory,
    pub message: String,
}

/// Accepted code for one taxonomy, recorded by the categorization stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryAssignment {
    pub taxonomy: Taxonomy,
    pub task_id: TaskId,
    pub code: Option<String>,
    pub label: Option<String>,
    pub confidence: f64,
    pub strategy: Option<StrategyKind>,
    pub low_confidence: bool,
}

/// Immutable record of one stage attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSnapshot {
    #[serde(rename = "stage_name")]
    pub stage: Stage,
    pub input_value: String,
    pub output_value: String,
    pub applied_at: DateTime<Utc>,
    pub success: bool,
    pub error_detail: Option<ErrorDetail>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assignments: Vec<CategoryAssignment>,
}

impl StageSnapshot {
    pub fn succeeded(stage: Stage, input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            stage,
            input_value: input.into(),
            output_value: output.into(),
            applied_at: Utc::now(),
            success: true,
            error_detail: None,
            assignments: Vec::new(),
        }
    }

    pub fn failed(stage: Stage, input: impl Into<String>, detail: ErrorDetail) -> Self {
        let input = input.into();
        Self {
            stage,
            output_value: input.clone(),
            input_value: input,
            applied_at: Utc::now(),
            success: false,
            error_detail: Some(detail),
            assignments: Vec::new(),
        }
    }
}

/// Versioned normalization of one entity.
///
/// `stage_history` is an append-only log of every attempt. `active_path` holds the indices of
/// the snapshots that make up the current forward path; reverting truncates it, never the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizationSession {
    pub id: SessionId,
    pub entity_id: EntityId,
    pub original_name: String,
    pub status: SessionStatus,
    pub current_stage_index: usize,
    pub stage_history: Vec<StageSnapshot>,
    pub active_path: Vec<usize>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NormalizationSession {
    pub fn new(id: SessionId, entity_id: EntityId, original_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            entity_id,
            original_name: original_name.into(),
            status: SessionStatus::Created,
            current_stage_index: 0,
            stage_history: Vec::new(),
            active_path: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Value produced by the last snapshot on the active path
    pub fn current_value(&self) -> &str {
        self.active_path
            .last()
            .and_then(|idx| self.stage_history.get(*idx))
            .map(|snap| snap.output_value.as_str())
            .unwrap_or(&self.original_name)
    }

    /// Status implied by the cursor, ignoring the transient `reverted` label
    pub fn effective_status(&self) -> SessionStatus {
        match self.status {
            SessionStatus::Failed => SessionStatus::Failed,
            _ => status_for_index(self.current_stage_index),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, SessionStatus::Completed | SessionStatus::Failed)
    }

    pub fn has_applied(&self, stage: Stage) -> bool {
        self.stage_history.iter().any(|s| s.stage == stage)
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Taxonomy {
    /// Four-level legacy code tree (section, class, group, subgroup)
    LegacyCodeTree,
    /// Newer dotted hierarchical tree
    HierarchicalTree,
}

impl Taxonomy {
    pub const ALL: [Taxonomy; 2] = [Taxonomy::LegacyCodeTree, Taxonomy::HierarchicalTree];

    pub fn name(&self) -> &'static str {
        match self {
            Taxonomy::LegacyCodeTree => "legacy_code_tree",
            Taxonomy::HierarchicalTree => "hierarchical_tree",
        }
    }

    pub fn parse(name: &str) -> Option<Taxonomy> {
        Taxonomy::ALL.iter().copied().find(|t| t.name() == name)
    }
}

impl fmt::Display for Taxonomy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    MarkedIncorrect,
    MarkedCorrect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    ExactMatch,
    PatternRule,
    AiAssisted,
    Hybrid,
}

impl StrategyKind {
    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::ExactMatch => "exact_match",
            StrategyKind::PatternRule => "pattern_rule",
            StrategyKind::AiAssisted => "ai_assisted",
            StrategyKind::Hybrid => "hybrid",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationTask {
    pub id: TaskId,
    pub entity_id: EntityId,
    pub taxonomy: Taxonomy,
    /// Cleaned name the strategies ran against
    pub name: String,
    pub candidate_code: Option<String>,
    pub candidate_label: Option<String>,
    pub confidence: f64,
    pub strategy_used: Option<StrategyKind>,
    pub status: TaskStatus,
    /// Set when no strategy cleared the acceptance threshold
    pub low_confidence: bool,
    pub incorrect_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ClassificationTask {
    /// No strategy produced any candidate
    pub fn is_unclassified(&self) -> bool {
        self.candidate_code.is_none()
    }

    pub fn needs_review(&self) -> bool {
        self.low_confidence || self.is_unclassified()
    }

    pub fn assignment(&self) -> CategoryAssignment {
        CategoryAssignment {
            taxonomy: self.taxonomy,
            task_id: self.id,
            code: self.candidate_code.clone(),
            label: self.candidate_label.clone(),
            confidence: self.confidence,
            strategy: self.strategy_used,
            low_confidence: self.low_confidence,
        }
    }
}

/// Outcome of a batch reclassification
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchResult {
    pub processed: Vec<ClassificationTask>,
    pub skipped: Vec<EntityId>,
    pub failed: Vec<(EntityId, ErrorDetail)>,
}

// ---------------------------------------------------------------------------
// Worker pool
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    Correction,
    Classification,
}

/// Payload handed to an AI provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub kind: WorkKind,
    pub prompt: String,
    #[serde(default)]
    pub context: Vec<String>,
    #[serde(default)]
    pub use_chat_mode: bool,
}

impl WorkerRequest {
    pub fn correction(name: impl Into<String>, use_chat_mode: bool) -> Self {
        Self {
            kind: WorkKind::Correction,
            prompt: name.into(),
            context: Vec::new(),
            use_chat_mode,
        }
    }

    pub fn classification(prompt: impl Into<String>, context: Vec<String>) -> Self {
        Self {
            kind: WorkKind::Classification,
            prompt: prompt.into(),
            context,
            use_chat_mode: true,
        }
    }
}

/// Successful provider answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiResponse {
    pub label: String,
    /// Certainty reported by the provider, if any
    pub confidence: Option<f64>,
    #[serde(default)]
    pub provider: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Stopped,
}

/// Task owned by the orchestrator until its result is delivered
#[derive(Debug, Clone)]
pub struct WorkerTask {
    pub id: u64,
    pub provider: Option<String>,
    pub payload: WorkerRequest,
    pub status: WorkerStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub duration: Option<Duration>,
    pub retry_count: u32,
}

impl WorkerTask {
    pub fn new(id: u64, payload: WorkerRequest) -> Self {
        Self {
            id,
            provider: None,
            payload,
            status: WorkerStatus::Queued,
            started_at: None,
            duration: None,
            retry_count: 0,
        }
    }
}

/// Outcomes kept for the rolling failure rate unless a window is set explicitly
pub const DEFAULT_HEALTH_WINDOW: usize = 20;

/// Per-provider counters, updated once per task outcome on that provider
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProviderStats {
    pub provider: String,
    pub requests_total: u64,
    pub requests_success: u64,
    pub requests_failed: u64,
    /// Failure share over the most recent outcomes only
    pub failure_rate: f64,
    pub avg_response_time_ms: f64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Recent outcomes, oldest first; `true` marks a failure
    #[serde(skip)]
    recent: VecDeque<bool>,
    #[serde(skip)]
    window: usize,
    #[serde(skip)]
    last_outcome_at: Option<Instant>,
}

impl ProviderStats {
    pub fn new(provider: impl Into<String>) -> Self {
        Self::with_window(provider, DEFAULT_HEALTH_WINDOW)
    }

    pub fn with_window(provider: impl Into<String>, window: usize) -> Self {
        Self {
            provider: provider.into(),
            window: window.max(1),
            ..Default::default()
        }
    }

    /// Outcomes currently inside the rolling window
    pub fn window_samples(&self) -> usize {
        self.recent.len()
    }

    /// Time since the last recorded outcome, if any
    pub fn since_last_outcome(&self) -> Option<Duration> {
        self.last_outcome_at.map(|t| t.elapsed())
    }

    /// Forget recent outcomes; lifetime counters are kept
    pub fn reset_window(&mut self) {
        self.recent.clear();
        self.failure_rate = 0.0;
    }

    pub fn record(&mut self, elapsed: Duration, error: Option<&str>) {
        let n = self.requests_total as f64;
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.avg_response_time_ms = (self.avg_response_time_ms * n + ms) / (n + 1.0);
        self.requests_total += 1;
        self.last_outcome_at = Some(Instant::now());
        match error {
            None => {
                self.requests_success += 1;
                self.last_success = Some(Utc::now());
            }
            Some(err) => {
                self.requests_failed += 1;
                self.last_failure = Some(Utc::now());
                self.last_error = Some(err.to_string());
            }
        }

        self.recent.push_back(error.is_some());
        while self.recent.len() > self.window.max(1) {
            self.recent.pop_front();
        }
        let failures = self.recent.iter().filter(|f| **f).count();
        self.failure_rate = failures as f64 / self.recent.len() as f64;
    }
}

// ---------------------------------------------------------------------------
// Duplicates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Unresolved,
    Merged,
    KeptSeparate,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicateGroup {
    pub group_id: GroupId,
    pub member_entity_ids: Vec<EntityId>,
    pub representative_id: EntityId,
    /// Pairwise scores inside the group, smaller id first
    pub similarity_scores: Vec<(EntityId, EntityId, f64)>,
    pub resolution: Resolution,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Ranked match returned by single-entity lookups
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarCandidate {
    pub entity_id: EntityId,
    pub name: String,
    pub score: f64,
}
