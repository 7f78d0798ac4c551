//! Strategic resolution: collapse a set of candidate actions into one.
//!
//! Each candidate gets an explicit score from caller-declared metadata
//! (`priorities`, `preferredAction`) and an implicit score from the
//! [`ScoringTable`] (historical success rate under the same signature, plus
//! recency). The weighted sum decides; the first-declared action wins ties.
//!
//! `resolve` never mutates the table, so two calls with the same context,
//! weights and table always agree. Outcomes are fed back separately through
//! [`StrategicResolver::record_outcome`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::chunk::{Chunk, Metadata};
use crate::error::{Error, Result};
use crate::{clog, clog_debug};

/// Metadata key holding a map of `action -> priority in [0, 1]`.
pub const PRIORITIES_KEY: &str = "priorities";
/// Metadata key naming the action the caller would prefer.
pub const PREFERRED_ACTION_KEY: &str = "preferredAction";
/// Metadata key listing candidate actions for a chunk.
pub const ACTIONS_KEY: &str = "actions";
/// Metadata key used to group similar contexts in the scoring table.
pub const SIGNATURE_KEY: &str = "kind";
/// Action used when a chunk declares none.
pub const DEFAULT_ACTION: &str = "process";

const PRIORITY_SHARE: f64 = 0.5;
const SUCCESS_SHARE: f64 = 0.7;

/// Identifier of a tactical action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(pub String);

impl ActionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ActionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What needs deciding, and the candidates to decide between.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategicContext {
    pub description: String,
    pub possible_actions: Vec<ActionId>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl StrategicContext {
    pub fn new(description: impl Into<String>, possible_actions: Vec<ActionId>) -> Self {
        Self {
            description: description.into(),
            possible_actions,
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Build the context for a ready chunk.
    ///
    /// Candidates come from `metadata.actions` (default `["process"]`); the
    /// signature defaults to the chunk kind.
    pub fn for_chunk(chunk: &Chunk) -> Self {
        let possible_actions = match chunk.metadata.get(ACTIONS_KEY) {
            Some(serde_json::Value::Array(values)) => values
                .iter()
                .filter_map(|v| v.as_str())
                .map(ActionId::from)
                .collect(),
            Some(serde_json::Value::String(s)) => vec![ActionId::from(s.as_str())],
            _ => vec![ActionId::from(DEFAULT_ACTION)],
        };
        let mut metadata = chunk.metadata.clone();
        metadata
            .entry(SIGNATURE_KEY.to_string())
            .or_insert_with(|| serde_json::Value::String(chunk.kind.to_string()));
        Self {
            description: chunk.content().to_string(),
            possible_actions,
            metadata,
        }
    }

    /// Key grouping similar contexts in the scoring table.
    pub fn signature(&self) -> String {
        match self.metadata.get(SIGNATURE_KEY) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "default".to_string(),
        }
    }

    fn priority_of(&self, action: &ActionId) -> f64 {
        self.metadata
            .get(PRIORITIES_KEY)
            .and_then(|p| p.get(action.as_str()))
            .and_then(|v| v.as_f64())
            .filter(|v| v.is_finite())
            .map(|v| v.clamp(0.0, 1.0))
            .unwrap_or(0.0)
    }

    fn prefers(&self, action: &ActionId) -> bool {
        self.metadata
            .get(PREFERRED_ACTION_KEY)
            .and_then(|v| v.as_str())
            .map(|preferred| preferred == action.as_str())
            .unwrap_or(false)
    }
}

/// The single chosen action plus the metadata it was chosen under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TacticalAction {
    pub action: ActionId,
    pub metadata: Metadata,
    pub score: f64,
}

/// Relative weight of explicit and implicit scores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolutionWeights {
    pub explicit: f64,
    pub implicit: f64,
}

impl Default for ResolutionWeights {
    fn default() -> Self {
        Self {
            explicit: 0.6,
            implicit: 0.4,
        }
    }
}

impl ResolutionWeights {
    pub fn new(explicit: f64, implicit: f64) -> Self {
        Self { explicit, implicit }
    }

    /// Scale the weights to sum to 1.
    pub fn normalized(&self) -> Result<Self> {
        let valid = |w: f64| w.is_finite() && w >= 0.0;
        if !valid(self.explicit) || !valid(self.implicit) {
            return Err(Error::Validation(format!(
                "resolution weights must be finite and non-negative, got {} / {}",
                self.explicit, self.implicit
            )));
        }
        let sum = self.explicit + self.implicit;
        if sum <= 0.0 {
            return Err(Error::Validation(
                "resolution weights must not both be zero".to_string(),
            ));
        }
        Ok(Self {
            explicit: self.explicit / sum,
            implicit: self.implicit / sum,
        })
    }
}

/// Per-candidate breakdown of a resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionScore {
    pub action: ActionId,
    pub explicit: f64,
    pub implicit: f64,
    pub total: f64,
}

/// Outcome of a `resolve` call; persisted as a decision record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub context: StrategicContext,
    pub weights: ResolutionWeights,
    pub scores: Vec<ActionScore>,
    pub chosen: TacticalAction,
}

/// Observed outcomes for one action under one signature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeStats {
    pub successes: u32,
    pub failures: u32,
    /// Table sequence number of the most recent outcome.
    pub last_seq: Option<u64>,
}

impl OutcomeStats {
    /// Laplace-smoothed success rate; 0.5 with no history.
    pub fn success_rate(&self) -> f64 {
        (self.successes as f64 + 1.0) / (self.successes as f64 + self.failures as f64 + 2.0)
    }
}

/// History the implicit score is computed from.
///
/// Recency is measured in recorded outcomes, not wall-clock time, so the
/// score depends only on the table's contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoringTable {
    seq: u64,
    stats: BTreeMap<String, BTreeMap<ActionId, OutcomeStats>>,
}

impl ScoringTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, signature: &str, action: &ActionId, success: bool) {
        self.seq += 1;
        let stats = self
            .stats
            .entry(signature.to_string())
            .or_default()
            .entry(action.clone())
            .or_default();
        if success {
            stats.successes += 1;
        } else {
            stats.failures += 1;
        }
        stats.last_seq = Some(self.seq);
    }

    pub fn stats(&self, signature: &str, action: &ActionId) -> OutcomeStats {
        self.stats
            .get(signature)
            .and_then(|m| m.get(action))
            .copied()
            .unwrap_or_default()
    }

    /// Number of outcomes recorded so far.
    pub fn len(&self) -> u64 {
        self.seq
    }

    pub fn is_empty(&self) -> bool {
        self.seq == 0
    }

    /// `0.7 * success_rate + 0.3 * recency`, recency being
    /// `1 / (1 + outcomes recorded since this action's last one)`.
    pub fn implicit_score(&self, signature: &str, action: &ActionId) -> f64 {
        let stats = self.stats(signature, action);
        let recency = match stats.last_seq {
            Some(last) => 1.0 / (1.0 + self.seq.saturating_sub(last) as f64),
            None => 0.0,
        };
        SUCCESS_SHARE * stats.success_rate() + (1.0 - SUCCESS_SHARE) * recency
    }
}

/// Chooses exactly one tactical action per strategic context.
#[derive(Debug, Clone, Default)]
pub struct StrategicResolver {
    table: ScoringTable,
    weights: ResolutionWeights,
}

impl StrategicResolver {
    pub fn new(weights: ResolutionWeights) -> Result<Self> {
        Ok(Self {
            table: ScoringTable::new(),
            weights: weights.normalized()?,
        })
    }

    pub fn with_table(mut self, table: ScoringTable) -> Self {
        self.table = table;
        self
    }

    pub fn table(&self) -> &ScoringTable {
        &self.table
    }

    pub fn weights(&self) -> ResolutionWeights {
        self.weights
    }

    /// Resolve with the resolver's configured weights.
    pub fn resolve(&self, context: &StrategicContext) -> Result<Resolution> {
        self.resolve_with(context, self.weights)
    }

    /// Score every candidate and return the winner.
    ///
    /// # Errors
    /// - `ResolutionAmbiguous` when the context has no candidates
    /// - `Validation` for unusable weights
    pub fn resolve_with(
        &self,
        context: &StrategicContext,
        weights: ResolutionWeights,
    ) -> Result<Resolution> {
        if context.possible_actions.is_empty() {
            clog_debug!("resolve: no candidates for '{}'", context.description);
            return Err(Error::ResolutionAmbiguous {
                description: context.description.clone(),
            });
        }
        let weights = weights.normalized()?;
        let signature = context.signature();

        let scores: Vec<ActionScore> = context
            .possible_actions
            .iter()
            .map(|action| {
                let type_match = if context.prefers(action) { 1.0 } else { 0.0 };
                let explicit = PRIORITY_SHARE * context.priority_of(action)
                    + (1.0 - PRIORITY_SHARE) * type_match;
                let implicit = self.table.implicit_score(&signature, action);
                ActionScore {
                    action: action.clone(),
                    explicit,
                    implicit,
                    total: weights.explicit * explicit + weights.implicit * implicit,
                }
            })
            .collect();

        // Strictly greater replaces, so the first-declared candidate keeps ties.
        let mut best = &scores[0];
        for score in &scores[1..] {
            if score.total > best.total {
                best = score;
            }
        }

        let chosen = TacticalAction {
            action: best.action.clone(),
            metadata: context.metadata.clone(),
            score: best.total,
        };

        clog!(
            "resolve '{}' [{}]: {} -> {} ({:.3})",
            context.description,
            signature,
            scores
                .iter()
                .map(|s| format!("{}={:.3}", s.action, s.total))
                .collect::<Vec<_>>()
                .join(" "),
            chosen.action,
            chosen.score
        );
        clog_debug!(
            "resolve context: {}",
            serde_json::to_string(context).unwrap_or_default()
        );

        Ok(Resolution {
            context: context.clone(),
            weights,
            scores,
            chosen,
        })
    }

    /// Feed a worker outcome back into the scoring table.
    pub fn record_outcome(&mut self, signature: &str, action: &ActionId, success: bool) {
        clog_debug!(
            "record_outcome [{}] {} success={}",
            signature,
            action,
            success
        );
        self.table.record(signature, action, success);
    }
}
