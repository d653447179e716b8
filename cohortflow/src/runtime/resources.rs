use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::budget::BudgetConfig;
use crate::retry::TransientRetryPolicy;
use crate::task::TaskClass;

/// Compute request for one task class.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceProfile {
    pub cpu: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
    /// Whether the task may run on reclaimable compute.
    pub preemptible: bool,
    /// Preemptions tolerated before the task fails.
    pub max_retries: u16,
    /// Container image, if the executor runs tasks in containers.
    pub image: Option<String>,
}

impl Default for ResourceProfile {
    fn default() -> Self {
        Self {
            cpu: 1,
            memory_mb: 7_000,
            disk_gb: 50,
            preemptible: true,
            max_retries: 2,
            image: None,
        }
    }
}

impl ResourceProfile {
    pub fn new(cpu: u32, memory_mb: u64, disk_gb: u64) -> Self {
        Self {
            cpu,
            memory_mb,
            disk_gb,
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u16) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_preemptible(mut self, preemptible: bool) -> Self {
        self.preemptible = preemptible;
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// JVM heap to request, leaving headroom for the process itself.
    pub fn java_heap_mb(&self) -> u64 {
        self.memory_mb.saturating_sub(self.memory_mb / 8).max(512)
    }

    /// Sizing used when a class has no explicit profile.
    pub fn default_for(class: TaskClass) -> Self {
        match class {
            TaskClass::Import => Self::new(4, 26_000, 200),
            TaskClass::Genotype => Self::new(2, 26_000, 200),
            TaskClass::HardFilter => Self::new(1, 3_750, 50),
            TaskClass::Gather => Self::new(1, 7_000, 200),
            TaskClass::Recalibrate => Self::new(2, 104_000, 100),
            TaskClass::Apply => Self::new(1, 7_000, 50),
            TaskClass::Metrics => Self::new(2, 7_000, 100),
        }
    }
}

/// Settings threaded into every [`TaskRunner`](super::TaskRunner).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Slots shared by task classes without their own limit.
    pub max_concurrent_tasks: usize,
    /// Per-class slot limits.
    pub class_limits: BTreeMap<TaskClass, usize>,
    pub transient: TransientRetryPolicy,
    pub profiles: BTreeMap<TaskClass, ResourceProfile>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 8,
            class_limits: BTreeMap::new(),
            transient: TransientRetryPolicy::default(),
            profiles: BTreeMap::new(),
        }
    }
}

impl RunnerConfig {
    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    pub fn with_class_limit(mut self, class: TaskClass, limit: usize) -> Self {
        self.class_limits.insert(class, limit);
        self
    }

    pub fn with_transient(mut self, transient: TransientRetryPolicy) -> Self {
        self.transient = transient;
        self
    }

    pub fn with_profile(mut self, class: TaskClass, profile: ResourceProfile) -> Self {
        self.profiles.insert(class, profile);
        self
    }

    pub fn profile(&self, class: TaskClass) -> ResourceProfile {
        self.profiles
            .get(&class)
            .cloned()
            .unwrap_or_else(|| ResourceProfile::default_for(class))
    }

    pub fn budget_config(&self) -> BudgetConfig<TaskClass> {
        self.class_limits.iter().fold(
            BudgetConfig::with_default(self.max_concurrent_tasks),
            |config, (class, limit)| config.with_limit(*class, *limit),
        )
    }
}
