use chrono::Weekday;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Discretized part of the (local) day
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeSlot {
    LateNight,
    EarlyMorning,
    Morning,
    Midday,
    Afternoon,
    Evening,
    Night,
}

/// Slot preferences of one content type
#[derive(Clone, Debug)]
pub struct ContentAffinity {
    pub preferred_slots: &'static [TimeSlot],
    pub optimal_hours: &'static [u32],
}

impl TimeSlot {
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            0..=4 => TimeSlot::LateNight,
            5..=7 => TimeSlot::EarlyMorning,
            8..=10 => TimeSlot::Morning,
            11..=13 => TimeSlot::Midday,
            14..=16 => TimeSlot::Afternoon,
            17..=20 => TimeSlot::Evening,
            _ => TimeSlot::Night,
        }
    }

    /// How good the slot is for publishing in general, 0..=100
    pub fn desirability(&self) -> f64 {
        match self {
            TimeSlot::LateNight => 10.0,
            TimeSlot::EarlyMorning => 45.0,
            TimeSlot::Morning => 80.0,
            TimeSlot::Midday => 90.0,
            TimeSlot::Afternoon => 70.0,
            TimeSlot::Evening => 85.0,
            TimeSlot::Night => 50.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeSlot::LateNight => "late night",
            TimeSlot::EarlyMorning => "early morning",
            TimeSlot::Morning => "morning",
            TimeSlot::Midday => "midday",
            TimeSlot::Afternoon => "afternoon",
            TimeSlot::Evening => "evening",
            TimeSlot::Night => "night",
        }
    }
}

impl fmt::Display for TimeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn day_weight(day: Weekday) -> f64 {
    match day {
        Weekday::Mon => 80.0,
        Weekday::Tue => 95.0,
        Weekday::Wed => 100.0,
        Weekday::Thu => 95.0,
        Weekday::Fri => 80.0,
        Weekday::Sat => 60.0,
        Weekday::Sun => 55.0,
    }
}

pub fn affinity_for(content_type: &str) -> ContentAffinity {
    use TimeSlot::*;
    match content_type.to_ascii_lowercase().as_str() {
        "news" | "breaking" => ContentAffinity {
            preferred_slots: &[EarlyMorning, Morning, Midday],
            optimal_hours: &[7, 8, 12],
        },
        "announcement" => ContentAffinity {
            preferred_slots: &[Morning, Midday],
            optimal_hours: &[9, 11],
        },
        "promotion" | "promotional" => ContentAffinity {
            preferred_slots: &[Midday, Evening],
            optimal_hours: &[12, 19],
        },
        "engagement" | "question" => ContentAffinity {
            preferred_slots: &[Evening, Night],
            optimal_hours: &[19, 20, 21],
        },
        "educational" | "tip" => ContentAffinity {
            preferred_slots: &[Morning, Afternoon],
            optimal_hours: &[10, 15],
        },
        "thread" => ContentAffinity {
            preferred_slots: &[Morning, Evening],
            optimal_hours: &[9, 18],
        },
        _ => ContentAffinity {
            preferred_slots: &[Morning, Midday, Evening],
            optimal_hours: &[9, 12, 18],
        },
    }
}

impl ContentAffinity {
    pub fn slot_match(&self, slot: TimeSlot) -> f64 {
        if self.preferred_slots.contains(&slot) {
            100.0
        } else {
            30.0
        }
    }

    /// Full bonus on an optimal hour, half within one hour of it
    pub fn precision_bonus(&self, hour: u32) -> f64 {
        let distance = self
            .optimal_hours
            .iter()
            .map(|&optimal| {
                let d = optimal.abs_diff(hour);
                d.min(24 - d)
            })
            .min()
            .unwrap_or(u32::MAX);
        match distance {
            0 => 100.0,
            1 => 50.0,
            _ => 0.0,
        }
    }
}
