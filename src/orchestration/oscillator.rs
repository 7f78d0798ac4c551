//! The dual-phase admission oscillator.
//!
//! Time alternates between `Emission` (dispatch permitted) and
//! `Consolidation` (dispatch held, integrity checks run), targeting a 3:1
//! time-in-phase ratio. A phase ends in one of three ways, checked in this
//! order on every tick:
//!
//! 1. its ceiling elapsed: a forced transition, logged as `PhaseTimeout`,
//!    costing coherence;
//! 2. its workload signalled completion and its target duration elapsed: an
//!    organic transition, restoring coherence;
//! 3. `force_transition` was called: a manual transition, coherence unchanged.
//!
//! While coherence sits below the floor, targets and ceilings of newly
//! entered phases are scaled down by `coherence / floor`. All of this is
//! arithmetic over the timestamps passed in; the oscillator never reads a
//! clock.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::{clog, clog_debug, clog_warn};

/// Oscillator tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OscillatorConfig {
    /// Length of one Emission + Consolidation cycle at full coherence.
    pub cycle_ms: u64,
    /// Share of the cycle targeted for Emission.
    pub emission_share: f64,
    /// Phase ceiling as a multiple of the phase target.
    pub ceiling_factor: f64,
    pub initial_coherence: f64,
    /// Below this, the oscillator stabilizes.
    pub coherence_floor: f64,
    /// Coherence lost per forced transition.
    pub timeout_penalty: f64,
    /// Coherence gained per organic transition.
    pub organic_reward: f64,
    /// Lower bound on the stabilization scale.
    pub min_stabilization_scale: f64,
}

impl Default for OscillatorConfig {
    fn default() -> Self {
        Self {
            cycle_ms: 4_000,
            emission_share: 0.75,
            ceiling_factor: 2.0,
            initial_coherence: 1.0,
            coherence_floor: 0.3,
            timeout_penalty: 0.05,
            organic_reward: 0.02,
            min_stabilization_scale: 0.25,
        }
    }
}

impl OscillatorConfig {
    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f64| -> Result<()> {
            if v.is_finite() && (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(Error::Validation(format!(
                    "oscillator.{} must be within [0, 1], got {}",
                    name, v
                )))
            }
        };
        if self.cycle_ms == 0 {
            return Err(Error::Validation(
                "oscillator.cycle_ms must be positive".to_string(),
            ));
        }
        if !(self.emission_share > 0.0 && self.emission_share < 1.0) {
            return Err(Error::Validation(format!(
                "oscillator.emission_share must be strictly between 0 and 1, got {}",
                self.emission_share
            )));
        }
        if !self.ceiling_factor.is_finite() || self.ceiling_factor < 1.0 {
            return Err(Error::Validation(format!(
                "oscillator.ceiling_factor must be >= 1, got {}",
                self.ceiling_factor
            )));
        }
        unit("initial_coherence", self.initial_coherence)?;
        unit("coherence_floor", self.coherence_floor)?;
        unit("timeout_penalty", self.timeout_penalty)?;
        unit("organic_reward", self.organic_reward)?;
        unit("min_stabilization_scale", self.min_stabilization_scale)?;
        if self.min_stabilization_scale == 0.0 {
            return Err(Error::Validation(
                "oscillator.min_stabilization_scale must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Target share of `phase` within a cycle.
    pub fn share(&self, phase: Phase) -> f64 {
        match phase {
            Phase::Emission => self.emission_share,
            Phase::Consolidation => 1.0 - self.emission_share,
        }
    }

    /// Emission:Consolidation ratio, e.g. `3:1`.
    pub fn ratio_label(&self) -> String {
        let ratio = self.emission_share / (1.0 - self.emission_share);
        format!("{}:1", (ratio * 100.0).round() / 100.0)
    }
}

/// Factor applied to phase durations at a given coherence.
///
/// `1.0` at or above the floor, `coherence / floor` below it, never less
/// than `min_scale`.
pub fn phase_scale(coherence: f64, floor: f64, min_scale: f64) -> f64 {
    if floor <= 0.0 || coherence >= floor {
        return 1.0;
    }
    (coherence / floor).clamp(min_scale, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Admission and dispatch permitted.
    Emission,
    /// Dispatch held; in-flight work drains, integrity checks run.
    Consolidation,
}

impl Phase {
    pub fn other(self) -> Phase {
        match self {
            Phase::Emission => Phase::Consolidation,
            Phase::Consolidation => Phase::Emission,
        }
    }

    pub fn admits_dispatch(self) -> bool {
        self == Phase::Emission
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Emission => write!(f, "emission"),
            Phase::Consolidation => write!(f, "consolidation"),
        }
    }
}

/// Why a phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCause {
    Organic,
    Timeout,
    Manual,
}

impl std::fmt::Display for TransitionCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransitionCause::Organic => write!(f, "organic"),
            TransitionCause::Timeout => write!(f, "timeout"),
            TransitionCause::Manual => write!(f, "manual"),
        }
    }
}

/// The authoritative oscillator state; persisted as the singleton phase
/// record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseState {
    pub phase: Phase,
    pub entered_at: DateTime<Utc>,
    pub coherence: f64,
    /// Completed Emission + Consolidation cycles.
    pub cycle_count: u64,
    pub stabilizing: bool,
    /// Target and ceiling of the current phase, fixed on entry.
    pub target_ms: u64,
    pub ceiling_ms: u64,
    /// Whether the current phase's workload has signalled completion.
    #[serde(default)]
    pub completion_signalled: bool,
    #[serde(default)]
    pub emission_ms_total: u64,
    #[serde(default)]
    pub consolidation_ms_total: u64,
    #[serde(default)]
    pub organic_transitions: u64,
    #[serde(default)]
    pub timeout_transitions: u64,
    #[serde(default)]
    pub manual_transitions: u64,
}

impl PhaseState {
    /// Observed share of completed phase time spent in Emission.
    pub fn observed_emission_share(&self) -> Option<f64> {
        let total = self.emission_ms_total + self.consolidation_ms_total;
        if total == 0 {
            None
        } else {
            Some(self.emission_ms_total as f64 / total as f64)
        }
    }
}

/// A completed transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: Phase,
    pub to: Phase,
    pub cause: TransitionCause,
    /// Time spent in `from`.
    pub elapsed_ms: u64,
    /// Coherence after the transition.
    pub coherence: f64,
    pub cycle_count: u64,
    pub at: DateTime<Utc>,
}

/// One row of the coherence log, appended on every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoherenceLogEntry {
    pub at: DateTime<Utc>,
    pub coherence: f64,
    pub observed_emission_share: Option<f64>,
    /// Configured Emission:Consolidation ratio.
    pub ratio: String,
    pub cause: TransitionCause,
    pub from: Phase,
    pub to: Phase,
    pub stabilizing: bool,
}

/// Read-only view returned by `get_phase_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseStatus {
    pub phase: Phase,
    pub coherence: f64,
    pub cycle_count: u64,
    pub elapsed_ms: u64,
    pub target_ms: u64,
    pub ceiling_ms: u64,
    pub stabilizing: bool,
    pub observed_emission_share: Option<f64>,
    pub timeout_transitions: u64,
    /// Issues found by the most recent integrity check.
    pub integrity_issues: usize,
}

/// Deterministic two-phase scheduler.
#[derive(Debug, Clone)]
pub struct PhaseOscillator {
    config: OscillatorConfig,
    state: PhaseState,
}

impl PhaseOscillator {
    /// Start in Emission at `now`.
    pub fn new(config: OscillatorConfig, now: DateTime<Utc>) -> Result<Self> {
        config.validate()?;
        let coherence = config.initial_coherence;
        let (target_ms, ceiling_ms, stabilizing) = durations(&config, Phase::Emission, coherence);
        let state = PhaseState {
            phase: Phase::Emission,
            entered_at: now,
            coherence,
            cycle_count: 0,
            stabilizing,
            target_ms,
            ceiling_ms,
            completion_signalled: false,
            emission_ms_total: 0,
            consolidation_ms_total: 0,
            organic_transitions: 0,
            timeout_transitions: 0,
            manual_transitions: 0,
        };
        clog_debug!(
            "Oscillator started in emission: target={}ms ceiling={}ms",
            target_ms,
            ceiling_ms
        );
        Ok(Self { config, state })
    }

    /// Resume from a persisted state.
    pub fn restore(config: OscillatorConfig, state: PhaseState) -> Result<Self> {
        config.validate()?;
        if !(0.0..=1.0).contains(&state.coherence) {
            return Err(Error::Validation(format!(
                "persisted coherence {} outside [0, 1]",
                state.coherence
            )));
        }
        Ok(Self { config, state })
    }

    pub fn config(&self) -> &OscillatorConfig {
        &self.config
    }

    pub fn state(&self) -> &PhaseState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn coherence(&self) -> f64 {
        self.state.coherence
    }

    pub fn admits_dispatch(&self) -> bool {
        self.state.phase.admits_dispatch()
    }

    /// Time spent in the current phase as of `now`.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        Duration::from_millis(elapsed_ms(self.state.entered_at, now))
    }

    /// Target duration of `phase` if it were entered at the current coherence.
    pub fn target_duration(&self, phase: Phase) -> Duration {
        Duration::from_millis(durations(&self.config, phase, self.state.coherence).0)
    }

    pub fn ceiling_duration(&self, phase: Phase) -> Duration {
        Duration::from_millis(durations(&self.config, phase, self.state.coherence).1)
    }

    /// Record whether the current phase's workload is finished. The signal
    /// is cleared on every transition.
    pub fn set_completion(&mut self, complete: bool) {
        self.state.completion_signalled = complete;
    }

    /// Advance the oscillator to `now`, transitioning if a trigger fired.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Option<PhaseTransition> {
        let elapsed = elapsed_ms(self.state.entered_at, now);
        if elapsed >= self.state.ceiling_ms {
            Some(self.transition(TransitionCause::Timeout, now))
        } else if self.state.completion_signalled && elapsed >= self.state.target_ms {
            Some(self.transition(TransitionCause::Organic, now))
        } else {
            None
        }
    }

    /// Flip phase immediately.
    pub fn force_transition(&mut self, now: DateTime<Utc>) -> PhaseTransition {
        self.transition(TransitionCause::Manual, now)
    }

    pub fn status(&self, now: DateTime<Utc>) -> PhaseStatus {
        PhaseStatus {
            phase: self.state.phase,
            coherence: self.state.coherence,
            cycle_count: self.state.cycle_count,
            elapsed_ms: elapsed_ms(self.state.entered_at, now),
            target_ms: self.state.target_ms,
            ceiling_ms: self.state.ceiling_ms,
            stabilizing: self.state.stabilizing,
            observed_emission_share: self.state.observed_emission_share(),
            timeout_transitions: self.state.timeout_transitions,
            integrity_issues: 0,
        }
    }

    /// Coherence log row describing `transition`.
    pub fn coherence_entry(&self, transition: &PhaseTransition) -> CoherenceLogEntry {
        CoherenceLogEntry {
            at: transition.at,
            coherence: transition.coherence,
            observed_emission_share: self.state.observed_emission_share(),
            ratio: self.config.ratio_label(),
            cause: transition.cause,
            from: transition.from,
            to: transition.to,
            stabilizing: self.state.stabilizing,
        }
    }

    fn transition(&mut self, cause: TransitionCause, now: DateTime<Utc>) -> PhaseTransition {
        let from = self.state.phase;
        let to = from.other();
        let elapsed = elapsed_ms(self.state.entered_at, now);

        match from {
            Phase::Emission => self.state.emission_ms_total += elapsed,
            Phase::Consolidation => self.state.consolidation_ms_total += elapsed,
        }

        match cause {
            TransitionCause::Timeout => {
                self.state.coherence -= self.config.timeout_penalty;
                self.state.timeout_transitions += 1;
                let timeout = Error::PhaseTimeout {
                    phase: from.to_string(),
                    elapsed: Duration::from_millis(elapsed),
                };
                clog_warn!("{} (ceiling {}ms)", timeout, self.state.ceiling_ms);
            }
            TransitionCause::Organic => {
                self.state.coherence += self.config.organic_reward;
                self.state.organic_transitions += 1;
            }
            TransitionCause::Manual => {
                self.state.manual_transitions += 1;
            }
        }
        self.state.coherence = self.state.coherence.clamp(0.0, 1.0);

        if to == Phase::Emission {
            self.state.cycle_count += 1;
        }

        let (target_ms, ceiling_ms, stabilizing) = durations(&self.config, to, self.state.coherence);
        if stabilizing && !self.state.stabilizing {
            clog_warn!(
                "Coherence {:.3} below floor {:.3}: stabilizing",
                self.state.coherence,
                self.config.coherence_floor
            );
        } else if !stabilizing && self.state.stabilizing {
            clog!("Coherence recovered to {:.3}", self.state.coherence);
        }

        self.state.phase = to;
        self.state.entered_at = now;
        self.state.target_ms = target_ms;
        self.state.ceiling_ms = ceiling_ms;
        self.state.stabilizing = stabilizing;
        self.state.completion_signalled = false;

        clog!(
            "Phase {} -> {} ({}) after {}ms, coherence {:.3}, next target {}ms",
            from,
            to,
            cause,
            elapsed,
            self.state.coherence,
            target_ms
        );

        PhaseTransition {
            from,
            to,
            cause,
            elapsed_ms: elapsed,
            coherence: self.state.coherence,
            cycle_count: self.state.cycle_count,
            at: now,
        }
    }
}

/// `(target_ms, ceiling_ms, stabilizing)` for entering `phase` at `coherence`.
fn durations(config: &OscillatorConfig, phase: Phase, coherence: f64) -> (u64, u64, bool) {
    let stabilizing = coherence < config.coherence_floor;
    let scale = phase_scale(
        coherence,
        config.coherence_floor,
        config.min_stabilization_scale,
    );
    let target = (config.cycle_ms as f64 * config.share(phase) * scale).round();
    let ceiling = (target * config.ceiling_factor).round();
    (target.max(1.0) as u64, ceiling.max(1.0) as u64, stabilizing)
}

fn elapsed_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    (to - from).num_milliseconds().max(0) as u64
}
