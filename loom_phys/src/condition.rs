//! The fixed 3x3 looming grid: direction (rows) by expansion speed (columns).

use std::fmt;

use serde::{Deserialize, Serialize};

pub const CONDITION_COUNT: usize = 9;

const LABELS: [&str; CONDITION_COUNT] = [
    "left, 22 l/v",
    "left, 44 l/v",
    "left, 88 l/v",
    "center, 22 l/v",
    "center, 44 l/v",
    "center, 88 l/v",
    "right, 22 l/v",
    "right, 44 l/v",
    "right, 88 l/v",
];

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Left,
    Center,
    Right,
}

impl Direction {
    pub const ALL: [Direction; 3] = [Direction::Left, Direction::Center, Direction::Right];

    pub fn name(&self) -> &'static str {
        match self {
            Direction::Left => "left",
            Direction::Center => "center",
            Direction::Right => "right",
        }
    }
}

/// Expansion rate of the looming disc, ordered from the smallest l/v upwards.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Speed {
    Slow,
    Medium,
    Fast,
}

impl Speed {
    pub const ALL: [Speed; 3] = [Speed::Slow, Speed::Medium, Speed::Fast];

    pub fn name(&self) -> &'static str {
        match self {
            Speed::Slow => "slow",
            Speed::Medium => "medium",
            Speed::Fast => "fast",
        }
    }

    /// Half-size over approach velocity in milliseconds.
    pub fn l_over_v_ms(&self) -> u32 {
        match self {
            Speed::Slow => 22,
            Speed::Medium => 44,
            Speed::Fast => 88,
        }
    }

    fn column(&self) -> usize {
        match self {
            Speed::Slow => 0,
            Speed::Medium => 1,
            Speed::Fast => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Condition {
    pub direction: Direction,
    pub speed: Speed,
}

impl Condition {
    pub fn index(&self) -> usize {
        let row = match self.direction {
            Direction::Left => 0,
            Direction::Center => 1,
            Direction::Right => 2,
        };
        row * Speed::ALL.len() + self.speed.column()
    }

    pub fn label(&self) -> &'static str {
        LABELS[self.index()]
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Row-major lookup: `index / 3` selects the direction, `index % 3` the speed.
pub fn condition_for_index(index: usize) -> Option<Condition> {
    if index >= CONDITION_COUNT {
        return None;
    }
    let cols = Speed::ALL.len();
    Some(Condition {
        direction: Direction::ALL[index / cols],
        speed: Speed::ALL[index % cols],
    })
}

pub fn condition_labels() -> &'static [&'static str; CONDITION_COUNT] {
    &LABELS
}

/// Condition indices sharing one speed, ordered left, center, right.
pub fn conditions_with_speed(speed: Speed) -> [usize; 3] {
    Direction::ALL.map(|direction| Condition { direction, speed }.index())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_mapping_round_trips() {
        for idx in 0..CONDITION_COUNT {
            let cond = condition_for_index(idx).unwrap();
            assert_eq!(cond.index(), idx);
            assert_eq!(cond.label(), condition_labels()[idx]);
        }
        assert!(condition_for_index(CONDITION_COUNT).is_none());
    }

    #[test]
    fn test_row_major_layout() {
        let cond = condition_for_index(5).unwrap();
        assert_eq!(cond.direction, Direction::Center);
        assert_eq!(cond.speed, Speed::Fast);
        assert_eq!(cond.speed.l_over_v_ms(), 88);
        assert_eq!(cond.to_string(), "center, 88 l/v");
    }

    #[test]
    fn test_conditions_with_speed() {
        assert_eq!(conditions_with_speed(Speed::Slow), [0, 3, 6]);
        assert_eq!(conditions_with_speed(Speed::Medium), [1, 4, 7]);
        assert_eq!(conditions_with_speed(Speed::Fast), [2, 5, 8]);
    }
}
