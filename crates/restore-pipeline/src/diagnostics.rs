//! Per-stage timing and outcome records.
//!
//! Every stage call made by a [`PipelineJob`](crate::PipelineJob) leaves
//! a [`StageRecord`] behind, whether it succeeded or not. A phase call
//! returns its records bundled in a [`PhaseOutcome`], which is the typed
//! result merged into the job's failure state.
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits in a human-friendly way.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::stage::{Phase, Stage};

/// Serde support for `std::time::Duration` as fractional seconds.
pub mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }

    /// The same encoding for `Option<Duration>`, with `null` for `None`.
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serialize, Serializer};

        /// Serialize an optional `Duration` as fractional seconds or `null`.
        #[allow(clippy::ref_option)]
        pub fn serialize<S: Serializer>(
            duration: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            duration.map(|d| d.as_secs_f64()).serialize(serializer)
        }

        /// Deserialize an optional `Duration` from fractional seconds or `null`.
        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<f64>::deserialize(deserializer)?
                .map(|secs| {
                    Duration::try_from_secs_f64(secs).map_err(|_| {
                        serde::de::Error::custom(
                            "duration seconds must be finite, non-negative, and representable as a Duration",
                        )
                    })
                })
                .transpose()
        }
    }
}

/// How a single stage call ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    /// The stage returned without error.
    Succeeded,
    /// The stage returned an error, panicked, or timed out.
    Failed {
        /// Display form of the underlying [`StageError`](crate::StageError).
        reason: String,
    },
}

impl StageOutcome {
    /// Returns `true` for [`StageOutcome::Succeeded`].
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// Timing and outcome of one stage call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// The stage that ran.
    pub stage: Stage,
    /// The phase it ran in.
    pub phase: Phase,
    /// Wall-clock duration of the call (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// How the call ended.
    pub outcome: StageOutcome,
}

/// Result of one phase call on one job.
///
/// A failed outcome never means the phase was cut short: every enabled
/// stage of the phase has a record, in execution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseOutcome {
    /// The phase that ran.
    pub phase: Phase,
    /// One record per stage invoked, in order.
    pub records: Vec<StageRecord>,
}

impl PhaseOutcome {
    /// Returns `true` if every stage of the phase succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.records.iter().all(|r| r.outcome.is_success())
    }

    /// The stages that failed, with their reasons.
    pub fn failures(&self) -> impl Iterator<Item = (Stage, &str)> {
        self.records.iter().filter_map(|r| match &r.outcome {
            StageOutcome::Succeeded => None,
            StageOutcome::Failed { reason } => Some((r.stage, reason.as_str())),
        })
    }

    /// Total time spent in this phase's stages.
    #[must_use]
    pub fn total_duration(&self) -> Duration {
        self.records.iter().map(|r| r.duration).sum()
    }
}
