use crate::priority::PriorityLevel;
use crate::timing::slots::*;
use chrono::{DateTime, Datelike, Duration, FixedOffset, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Picks publish times inside a window, avoiding blackout hours
#[derive(Debug, Clone)]
pub struct TimingPredictor {
    config: TimingConfig,
    offset: FixedOffset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Local hours (0..=23) during which nothing is published
    pub blackout_hours: Vec<u32>,
    /// Upper bound on hourly instants examined per prediction
    pub max_candidates: usize,
    /// Offset of local time from UTC, in minutes
    pub utc_offset_minutes: i32,
    pub slot_weight: f64,
    pub day_weight: f64,
    pub affinity_weight: f64,
    pub precision_weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredInstant {
    pub time: DateTime<Utc>,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingPrediction {
    pub best_time: DateTime<Utc>,
    pub score: f64,
    pub alternatives: Vec<ScoredInstant>,
    pub confidence: f64,
    pub rationale: String,
    pub candidates_considered: usize,
    pub fallback: bool,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TimingError {
    #[error("Invalid UTC offset: {0} minutes")]
    InvalidOffset(i32),
    #[error("Invalid blackout hour: {0}")]
    InvalidBlackoutHour(u32),
    #[error("Every hour of the day is blacked out")]
    NoEligibleHour,
    #[error("Time out of range")]
    OutOfRange,
}

const MAX_ALTERNATIVES: usize = 3;
const FALLBACK_CONFIDENCE: f64 = 0.5;

impl TimingPredictor {
    pub fn new(config: TimingConfig) -> Result<Self, TimingError> {
        let offset = FixedOffset::east_opt(config.utc_offset_minutes.saturating_mul(60))
            .ok_or(TimingError::InvalidOffset(config.utc_offset_minutes))?;
        if let Some(&hour) = config.blackout_hours.iter().find(|&&h| h > 23) {
            return Err(TimingError::InvalidBlackoutHour(hour));
        }
        if (0..24).all(|h| config.blackout_hours.contains(&h)) {
            return Err(TimingError::NoEligibleHour);
        }
        Ok(Self { config, offset })
    }

    pub fn config(&self) -> &TimingConfig {
        &self.config
    }

    fn local_hour(&self, at: DateTime<Utc>) -> u32 {
        at.with_timezone(&self.offset).hour()
    }

    pub fn is_blackout(&self, at: DateTime<Utc>) -> bool {
        self.config.blackout_hours.contains(&self.local_hour(at))
    }

    /// Round up to the next local hour boundary
    fn ceil_to_hour(&self, at: DateTime<Utc>) -> Result<DateTime<Utc>, TimingError> {
        let offset_secs = self.offset.local_minus_utc() as i64;
        let local_secs = at.timestamp() + offset_secs;
        let rem = local_secs.rem_euclid(3600);
        if rem == 0 && at.timestamp_subsec_nanos() == 0 {
            return Ok(at);
        }
        DateTime::from_timestamp(local_secs - rem + 3600 - offset_secs, 0)
            .ok_or(TimingError::OutOfRange)
    }

    /// Desirability of publishing `content_type` at `at`, 0..=100, without
    /// window or urgency effects
    pub fn score_instant(&self, content_type: &str, at: DateTime<Utc>) -> f64 {
        let local = at.with_timezone(&self.offset);
        let hour = local.hour();
        let slot = TimeSlot::from_hour(hour);
        let affinity = affinity_for(content_type);

        let c = &self.config;
        let total_weight = c.slot_weight + c.day_weight + c.affinity_weight + c.precision_weight;
        if total_weight <= f64::EPSILON {
            return slot.desirability();
        }
        (slot.desirability() * c.slot_weight
            + day_weight(local.weekday()) * c.day_weight
            + affinity.slot_match(slot) * c.affinity_weight
            + affinity.precision_bonus(hour) * c.precision_weight)
            / total_weight
    }

    /// Small score delta used to nudge queue priority by time-slot fit.
    ///
    /// Ranges from -10 (blackout) through -5..=+5.
    pub fn slot_adjustment(&self, content_type: &str, at: DateTime<Utc>) -> f64 {
        if self.is_blackout(at) {
            return -10.0;
        }
        ((self.score_instant(content_type, at) - 50.0) / 10.0).clamp(-5.0, 5.0)
    }

    fn urgency_weight(priority: PriorityLevel) -> f64 {
        match priority {
            PriorityLevel::Urgent => 0.3,
            PriorityLevel::High => 0.15,
            _ => 0.0,
        }
    }

    /// Choose the best publish instant in `[earliest, latest]`
    pub fn predict(
        &self,
        content_type: &str,
        priority: PriorityLevel,
        earliest: DateTime<Utc>,
        latest: DateTime<Utc>,
    ) -> Result<TimingPrediction, TimingError> {
        let candidates = self.candidates(earliest, latest)?;
        if candidates.is_empty() {
            return self.fallback(content_type, earliest);
        }

        let window_hours = ((latest - earliest).num_minutes() as f64 / 60.0).max(1.0);
        let urgency = Self::urgency_weight(priority);

        let mut scored: Vec<ScoredInstant> = candidates
            .iter()
            .map(|&time| {
                let base = self.score_instant(content_type, time);
                let hours_in = (time - earliest).num_minutes() as f64 / 60.0;
                let earliness = (100.0 * (1.0 - hours_in / window_hours)).clamp(0.0, 100.0);
                ScoredInstant {
                    time,
                    score: base * (1.0 - urgency) + earliness * urgency,
                }
            })
            .collect();

        // Highest score first, earlier instant on ties
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.time.cmp(&b.time))
        });

        let best = scored.remove(0);
        let alternatives: Vec<ScoredInstant> = scored.into_iter().take(MAX_ALTERNATIVES).collect();
        let margin = alternatives
            .first()
            .map(|next| ((best.score - next.score) / 20.0).min(1.0))
            .unwrap_or(1.0);
        let confidence = ((best.score / 100.0) * 0.7 + margin * 0.3).clamp(0.0, 1.0);
        let rationale = self.rationale(content_type, &best, candidates.len());

        debug!(
            content_type,
            best_time = %best.time,
            score = best.score,
            confidence,
            "Predicted publish time"
        );

        Ok(TimingPrediction {
            best_time: best.time,
            score: best.score,
            alternatives,
            confidence,
            rationale,
            candidates_considered: candidates.len(),
            fallback: false,
        })
    }

    fn candidates(
        &self,
        earliest: DateTime<Utc>,
        latest: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, TimingError> {
        let mut out = Vec::new();
        if latest < earliest {
            return Ok(out);
        }
        let mut at = self.ceil_to_hour(earliest)?;
        let mut examined = 0;
        while at <= latest && examined < self.config.max_candidates {
            if !self.is_blackout(at) {
                out.push(at);
            }
            examined += 1;
            at += Duration::hours(1);
        }
        Ok(out)
    }

    fn fallback(
        &self,
        content_type: &str,
        earliest: DateTime<Utc>,
    ) -> Result<TimingPrediction, TimingError> {
        let mut at = earliest;
        if self.is_blackout(at) {
            at = self.ceil_to_hour(earliest)?;
            let mut steps = 0;
            while self.is_blackout(at) {
                steps += 1;
                if steps > 24 {
                    return Err(TimingError::NoEligibleHour);
                }
                at += Duration::hours(1);
            }
        }

        let local = at.with_timezone(&self.offset);
        Ok(TimingPrediction {
            best_time: at,
            score: self.score_instant(content_type, at),
            alternatives: Vec::new(),
            confidence: FALLBACK_CONFIDENCE,
            rationale: format!(
                "No eligible slot in the requested window; using earliest allowed time {} ({})",
                local.format("%a %H:%M"),
                TimeSlot::from_hour(local.hour())
            ),
            candidates_considered: 0,
            fallback: true,
        })
    }

    fn rationale(&self, content_type: &str, best: &ScoredInstant, considered: usize) -> String {
        let local = best.time.with_timezone(&self.offset);
        let hour = local.hour();
        let slot = TimeSlot::from_hour(hour);
        let affinity = affinity_for(content_type);

        let mut reasons = vec![format!(
            "{} {} is a {} slot",
            local.weekday(),
            local.format("%H:%M"),
            slot
        )];
        if affinity.preferred_slots.contains(&slot) {
            reasons.push(format!("{slot} suits {content_type} content"));
        }
        if affinity.precision_bonus(hour) >= 100.0 {
            reasons.push("optimal hour".to_string());
        }
        reasons.push(format!("{considered} candidates considered"));
        reasons.join(", ")
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            blackout_hours: vec![1, 2, 3, 4, 5],
            max_candidates: 168,
            utc_offset_minutes: 0,
            slot_weight: 0.4,
            day_weight: 0.2,
            affinity_weight: 0.25,
            precision_weight: 0.15,
        }
    }
}
