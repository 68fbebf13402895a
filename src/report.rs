use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

use crate::deploy::DeployStep;

/// One finished step of a deploy
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StepRecord {
    pub step: DeployStep,
    pub duration_ms: u64,
}

/// Record of a completed deploy sequence
#[derive(Debug, Clone, Serialize)]
pub struct DeployReport {
    pub id: String,
    pub repository: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepRecord>,
}

impl DeployReport {
    pub fn new(repository: &str) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            repository: repository.to_string(),
            started_at: Utc::now(),
            completed_at: None,
            steps: Vec::new(),
        }
    }

    pub fn record_step(&mut self, step: DeployStep, duration: Duration) {
        self.steps.push(StepRecord {
            step,
            duration_ms: duration.as_millis() as u64,
        });
    }

    pub fn mark_done(&mut self) {
        self.completed_at = Some(Utc::now());
    }

    pub fn ran(&self, step: DeployStep) -> bool {
        self.steps.iter().any(|record| record.step == step)
    }
}
