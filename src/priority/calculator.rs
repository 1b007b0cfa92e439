use crate::store::Task;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Computes how urgent a task is, on a 1..=100 scale.
///
/// Scores are a scheduling hint only and are recomputed on every admission.
#[derive(Debug, Clone)]
pub struct PriorityCalculator {
    weights: PriorityWeights,
}

/// Relative importance of each scoring factor.
///
/// Weights are renormalized so they sum to 1.0 before use.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PriorityWeights {
    pub time_urgency: f64,
    pub retry_count: f64,
    pub project_priority: f64,
    pub task_age: f64,
    pub schedule_delay: f64,
    pub content_type: f64,
}

/// Coarse priority tiers for consumers that need discrete levels
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PriorityLevel {
    VeryLow,
    Low,
    Normal,
    High,
    Urgent,
}

/// Per-factor breakdown of a score, each factor on 0..=100
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ScoreBreakdown {
    pub time_urgency: f64,
    pub retry_count: f64,
    pub project_priority: f64,
    pub task_age: f64,
    pub schedule_delay: f64,
    pub content_type: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PriorityScore {
    pub value: f64,
    pub level: PriorityLevel,
    pub breakdown: ScoreBreakdown,
}

impl PriorityCalculator {
    pub fn new(weights: PriorityWeights) -> Self {
        Self {
            weights: weights.normalized(),
        }
    }

    pub fn weights(&self) -> &PriorityWeights {
        &self.weights
    }

    /// Score a task against the current wall-clock time
    pub fn score(&self, task: &Task) -> PriorityScore {
        self.score_at(task, Utc::now())
    }

    /// Score a task as of `now`
    pub fn score_at(&self, task: &Task, now: DateTime<Utc>) -> PriorityScore {
        let breakdown = ScoreBreakdown {
            time_urgency: Self::time_urgency_score(task, now),
            retry_count: Self::retry_score(task.retry_count),
            project_priority: Self::project_priority_score(task.project_priority),
            task_age: Self::age_score(task, now),
            schedule_delay: Self::delay_score(task, now),
            content_type: Self::content_type_score(&task.content_type),
        };

        let w = &self.weights;
        let total = breakdown.time_urgency * w.time_urgency
            + breakdown.retry_count * w.retry_count
            + breakdown.project_priority * w.project_priority
            + breakdown.task_age * w.task_age
            + breakdown.schedule_delay * w.schedule_delay
            + breakdown.content_type * w.content_type;

        let value = total.clamp(1.0, 100.0);
        debug!(task_id = %task.id, score = value, "Calculated priority score");

        PriorityScore {
            value,
            level: PriorityLevel::from_score(value),
            breakdown,
        }
    }

    /// Overdue tasks saturate towards 100, future tasks decay with distance
    fn time_urgency_score(task: &Task, now: DateTime<Utc>) -> f64 {
        let minutes_until = (task.scheduled_time - now).num_seconds() as f64 / 60.0;
        if minutes_until <= 0.0 {
            let overdue = -minutes_until;
            85.0 + 15.0 * (1.0 - (-overdue / 60.0).exp())
        } else if minutes_until <= 15.0 {
            75.0
        } else if minutes_until <= 60.0 {
            60.0
        } else if minutes_until <= 360.0 {
            40.0
        } else if minutes_until <= 1440.0 {
            25.0
        } else {
            10.0
        }
    }

    fn retry_score(retry_count: u32) -> f64 {
        (10.0 + 30.0 * retry_count as f64).min(100.0)
    }

    fn project_priority_score(priority: u8) -> f64 {
        match priority.clamp(1, 5) {
            1 => 20.0,
            2 => 40.0,
            3 => 60.0,
            4 => 80.0,
            _ => 100.0,
        }
    }

    /// Older unprocessed tasks score higher, saturating after two days
    fn age_score(task: &Task, now: DateTime<Utc>) -> f64 {
        let age_hours = (now - task.created_at).num_seconds().max(0) as f64 / 3600.0;
        (age_hours * 100.0 / 48.0).min(100.0)
    }

    fn delay_score(task: &Task, now: DateTime<Utc>) -> f64 {
        let minutes_late = task.overdue_by(now).num_seconds() as f64 / 60.0;
        (minutes_late * 100.0 / 120.0).min(100.0)
    }

    fn content_type_score(content_type: &str) -> f64 {
        match content_type.to_ascii_lowercase().as_str() {
            "breaking" | "news" => 100.0,
            "announcement" => 80.0,
            "promotion" | "promotional" => 60.0,
            "engagement" | "question" => 55.0,
            "thread" => 50.0,
            "educational" | "tip" => 45.0,
            "evergreen" => 30.0,
            _ => 50.0,
        }
    }
}

impl Default for PriorityCalculator {
    fn default() -> Self {
        Self::new(PriorityWeights::default())
    }
}

impl PriorityWeights {
    fn sum(&self) -> f64 {
        self.time_urgency
            + self.retry_count
            + self.project_priority
            + self.task_age
            + self.schedule_delay
            + self.content_type
    }

    /// Scale weights so they sum to 1.0; negative weights count as zero
    pub fn normalized(&self) -> Self {
        let clamped = Self {
            time_urgency: self.time_urgency.max(0.0),
            retry_count: self.retry_count.max(0.0),
            project_priority: self.project_priority.max(0.0),
            task_age: self.task_age.max(0.0),
            schedule_delay: self.schedule_delay.max(0.0),
            content_type: self.content_type.max(0.0),
        };
        let sum = clamped.sum();
        if !sum.is_finite() || sum <= f64::EPSILON {
            return Self::default();
        }
        Self {
            time_urgency: clamped.time_urgency / sum,
            retry_count: clamped.retry_count / sum,
            project_priority: clamped.project_priority / sum,
            task_age: clamped.task_age / sum,
            schedule_delay: clamped.schedule_delay / sum,
            content_type: clamped.content_type / sum,
        }
    }
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            time_urgency: 0.35,
            retry_count: 0.15,
            project_priority: 0.20,
            task_age: 0.10,
            schedule_delay: 0.15,
            content_type: 0.05,
        }
    }
}

impl PriorityLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            PriorityLevel::Urgent
        } else if score >= 60.0 {
            PriorityLevel::High
        } else if score >= 40.0 {
            PriorityLevel::Normal
        } else if score >= 20.0 {
            PriorityLevel::Low
        } else {
            PriorityLevel::VeryLow
        }
    }
}

impl fmt::Display for PriorityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PriorityLevel::VeryLow => "VERY_LOW",
            PriorityLevel::Low => "LOW",
            PriorityLevel::Normal => "NORMAL",
            PriorityLevel::High => "HIGH",
            PriorityLevel::Urgent => "URGENT",
        };
        f.write_str(name)
    }
}

impl PriorityScore {
    /// Queue ordering value: lower is served first
    pub fn queue_priority(&self) -> u32 {
        (101.0 - self.value).round().clamp(1.0, 100.0) as u32
    }

    /// Apply an additive adjustment, keeping the score in range
    pub fn adjusted(mut self, delta: f64) -> Self {
        self.value = (self.value + delta).clamp(1.0, 100.0);
        self.level = PriorityLevel::from_score(self.value);
        self
    }
}
