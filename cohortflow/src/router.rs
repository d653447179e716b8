//! Cohort-size routing.
//!
//! Two independent thresholds: one picks the gather strategy (small vs
//! non-small), the other decides whether the SNP filter is trained once on a
//! downsampled subset and reused per shard.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Largest cohort that still takes the single-merged-VCF gather branch.
pub const SMALL_COHORT_MAX_SAMPLES: usize = 1000;

/// Cohorts strictly larger than this train a reusable SNP model.
pub const SNP_MODEL_TRAINING_THRESHOLD: usize = 10500;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CohortSizeClass {
    Small,
    Medium,
    Large,
}

/// Which of the two mutually exclusive gather branches runs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatherBranch {
    Small,
    NonSmall,
}

impl fmt::Display for GatherBranch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatherBranch::Small => write!(f, "small-cohort"),
            GatherBranch::NonSmall => write!(f, "non-small-cohort"),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub num_samples: usize,
    pub size_class: CohortSizeClass,
    /// Train the SNP model once on downsampled data and scatter its application.
    pub train_model: bool,
    pub gather: GatherBranch,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingThresholds {
    pub small_cohort_max_samples: usize,
    pub snp_model_training_threshold: usize,
}

impl Default for RoutingThresholds {
    fn default() -> Self {
        Self {
            small_cohort_max_samples: SMALL_COHORT_MAX_SAMPLES,
            snp_model_training_threshold: SNP_MODEL_TRAINING_THRESHOLD,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CohortSizeRouter {
    thresholds: RoutingThresholds,
}

impl CohortSizeRouter {
    pub fn new(thresholds: RoutingThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> RoutingThresholds {
        self.thresholds
    }

    pub fn classify(&self, num_samples: usize) -> CohortSizeClass {
        if num_samples <= self.thresholds.small_cohort_max_samples {
            CohortSizeClass::Small
        } else if num_samples <= self.thresholds.snp_model_training_threshold {
            CohortSizeClass::Medium
        } else {
            CohortSizeClass::Large
        }
    }

    pub fn route(&self, num_samples: usize) -> RouteDecision {
        let gather = if num_samples <= self.thresholds.small_cohort_max_samples {
            GatherBranch::Small
        } else {
            GatherBranch::NonSmall
        };
        RouteDecision {
            num_samples,
            size_class: self.classify(num_samples),
            train_model: num_samples > self.thresholds.snp_model_training_threshold,
            gather,
        }
    }
}

/// Route with the default thresholds.
pub fn route(num_samples: usize) -> RouteDecision {
    CohortSizeRouter::default().route(num_samples)
}
