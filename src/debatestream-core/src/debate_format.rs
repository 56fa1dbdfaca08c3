//! Scripted beats of a stream.
//!
//! A stream has no fixed sections the way a formal debate does; instead a
//! handful of turn numbers carry scripted beats (opening, final round,
//! closing). [`BeatSchedule`] resolves those numbers from the turn budget
//! and any explicit overrides, and [`Stage`] names the part of the stream
//! a turn belongs to for the on-air overlay.

use serde::{Deserialize, Serialize};

use crate::config::RulesConfig;
use crate::participant::Speaker;

/// Closing turn used when the stream has no turn limit.
const UNLIMITED_CLOSING_TURN: u64 = 23;

/// Turn numbers carrying scripted beats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeatSchedule {
    pub intro_turn_a: u64,
    pub intro_turn_b: u64,
    pub final_round_a: u64,
    pub final_round_b: u64,
    pub closing_turn: u64,
}

impl BeatSchedule {
    /// Default beats for a turn budget (`0` means unlimited).
    ///
    /// Final round A is the last odd turn at least two before the end,
    /// final round B the last even turn before it, closing is the last turn.
    pub fn for_max_turns(max_turns: u64) -> Self {
        let closing = if max_turns > 0 {
            max_turns
        } else {
            UNLIMITED_CLOSING_TURN
        };

        Self {
            intro_turn_a: 1,
            intro_turn_b: 2,
            final_round_a: largest_with_parity(closing.saturating_sub(2), 1).max(1),
            final_round_b: largest_with_parity(closing.saturating_sub(1), 0).max(2),
            closing_turn: closing,
        }
    }

    /// Defaults for `max_turns` with explicit overrides from the rules section.
    pub fn from_rules(rules: &RulesConfig, max_turns: u64) -> Self {
        let defaults = Self::for_max_turns(max_turns);
        Self {
            intro_turn_a: rules.intro_turn_a,
            intro_turn_b: rules.intro_turn_b,
            final_round_a: rules.final_round_a.unwrap_or(defaults.final_round_a),
            final_round_b: rules.final_round_b.unwrap_or(defaults.final_round_b),
            closing_turn: rules.closing_turn.unwrap_or(defaults.closing_turn),
        }
    }

    pub fn is_closing(&self, turn_id: u64) -> bool {
        turn_id == self.closing_turn
    }

    pub fn is_intro(&self, turn_id: u64, speaker: Speaker) -> bool {
        match speaker {
            Speaker::A => turn_id == self.intro_turn_a,
            Speaker::B => turn_id == self.intro_turn_b,
        }
    }

    pub fn is_final_round(&self, turn_id: u64, speaker: Speaker) -> bool {
        match speaker {
            Speaker::A => turn_id == self.final_round_a,
            Speaker::B => turn_id == self.final_round_b,
        }
    }

    /// Part of the stream a turn belongs to.
    pub fn stage(&self, turn_id: u64) -> Stage {
        let final_start = self.final_round_a.min(self.final_round_b);
        if self.is_closing(turn_id) {
            Stage::Closing
        } else if turn_id <= self.intro_turn_a.max(self.intro_turn_b) {
            Stage::Opening
        } else if turn_id >= final_start && turn_id < self.closing_turn {
            Stage::Final
        } else {
            Stage::Discussion
        }
    }
}

impl Default for BeatSchedule {
    fn default() -> Self {
        Self::for_max_turns(0)
    }
}

/// Largest number `<= n` with `n % 2 == parity`, or 0 if there is none.
fn largest_with_parity(n: u64, parity: u64) -> u64 {
    if n % 2 == parity {
        n
    } else {
        n.saturating_sub(1)
    }
}

/// Named part of the stream, shown in the stage overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Opening,
    Discussion,
    Final,
    Closing,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Opening => "OPENING",
            Stage::Discussion => "DISCUSSION",
            Stage::Final => "FINAL",
            Stage::Closing => "CLOSING",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_for_default_budget() {
        let beats = BeatSchedule::for_max_turns(25);
        assert_eq!(beats.final_round_a, 23);
        assert_eq!(beats.final_round_b, 24);
        assert_eq!(beats.closing_turn, 25);
        assert!(beats.is_final_round(23, Speaker::A));
        assert!(!beats.is_final_round(23, Speaker::B));
    }

    #[test]
    fn test_schedule_for_short_budget() {
        let beats = BeatSchedule::for_max_turns(4);
        assert_eq!(
            (beats.final_round_a, beats.final_round_b, beats.closing_turn),
            (1, 2, 4)
        );

        let even = BeatSchedule::for_max_turns(10);
        assert_eq!((even.final_round_a, even.final_round_b), (7, 8));
    }

    #[test]
    fn test_schedule_unlimited() {
        let beats = BeatSchedule::for_max_turns(0);
        assert_eq!(
            (beats.final_round_a, beats.final_round_b, beats.closing_turn),
            (21, 22, 23)
        );
    }

    #[test]
    fn test_overrides_win() {
        let rules = RulesConfig {
            final_round_a: Some(11),
            closing_turn: Some(14),
            ..RulesConfig::default()
        };
        let beats = BeatSchedule::from_rules(&rules, 25);
        assert_eq!(beats.final_round_a, 11);
        assert_eq!(beats.final_round_b, 24);
        assert_eq!(beats.closing_turn, 14);
    }

    #[test]
    fn test_stage_progression() {
        let beats = BeatSchedule::for_max_turns(25);
        assert_eq!(beats.stage(1), Stage::Opening);
        assert_eq!(beats.stage(2), Stage::Opening);
        assert_eq!(beats.stage(3), Stage::Discussion);
        assert_eq!(beats.stage(22), Stage::Discussion);
        assert_eq!(beats.stage(23), Stage::Final);
        assert_eq!(beats.stage(24), Stage::Final);
        assert_eq!(beats.stage(25), Stage::Closing);
        assert_eq!(Stage::Closing.name(), "CLOSING");
    }
}
