//! Content rules applied to every generation request.
//!
//! [`RuleEngine::evaluate`] is a pure function of the next turn number, its
//! speaker and a history snapshot. Rules fire independently and their
//! directives are returned in a fixed order:
//!
//! 1. periodic level-shift roundup
//! 2. scripted opening beats
//! 3. methodology-loop detector
//! 4. term-repeat detector
//! 5. discriminator-phrase detector
//! 6. test-class throttling, followed by the change-of-plane directive
//! 7. periodic question
//! 8. steelman beats
//! 9. test-cycle rotation
//! 10. observation / interpretation alternation
//! 11. final-round beats
//! 12. stream closing
//!
//! The closing turn suppresses rules 1, 7, 8 and 9.

use std::collections::BTreeSet;

use crate::config::{RulesConfig, TestClassSpec};
use crate::debate_format::BeatSchedule;
use crate::participant::Speaker;
use crate::turn::HistoryEntry;

/// Directives for one turn plus the intermediate throttling state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleOutcome {
    pub directives: Vec<String>,
    /// Sorted labels over the per-window limit.
    pub blocked_classes: Vec<String>,
    /// Test suggested by the rotation rule, if it fired.
    pub suggested_test: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RuleEngine {
    rules: RulesConfig,
    beats: BeatSchedule,
}

impl RuleEngine {
    /// Keyword tables are lower-cased once here; matching is on lower-cased text.
    pub fn new(mut rules: RulesConfig, beats: BeatSchedule) -> Self {
        lowercase_all(&mut rules.methodology_keywords);
        lowercase_all(&mut rules.repeat_terms);
        lowercase_all(&mut rules.discriminator_markers);
        for spec in &mut rules.test_classes {
            lowercase_all(&mut spec.all);
            lowercase_all(&mut spec.any);
        }
        Self { rules, beats }
    }

    pub fn evaluate(&self, turn_id: u64, speaker: Speaker, history: &[HistoryEntry]) -> RuleOutcome {
        let r = &self.rules;
        let d = &r.directives;
        let closing = self.beats.is_closing(turn_id);
        let mut out = RuleOutcome::default();

        if !closing && every(turn_id, r.roundup_every_n) {
            out.directives.push(d.roundup.clone());
        }

        if self.beats.is_intro(turn_id, speaker) {
            out.directives.push(match speaker {
                Speaker::A => d.intro_a.clone(),
                Speaker::B => d.intro_b.clone(),
            });
        }

        if self.is_methodology_loop(history) {
            out.directives.push(d.methodology_loop.clone());
        }
        if self.is_term_repeat_loop(history) {
            out.directives.push(d.term_repeat.clone());
        }
        if self.used_discriminator_phrase(history) {
            out.directives.push(d.discriminator.clone());
        }

        out.blocked_classes = self.blocked_classes(history);
        if !out.blocked_classes.is_empty() {
            let mut directive = d
                .throttle
                .replace("{max}", &r.test_class_max.to_string())
                .replace("{window}", &r.test_class_window.to_string())
                .replace("{blocked}", &out.blocked_classes.join(", "));
            let allowed: Vec<&str> = r
                .test_classes
                .iter()
                .map(|spec| spec.label.as_str())
                .filter(|label| !out.blocked_classes.iter().any(|b| b == label))
                .collect();
            if !allowed.is_empty() {
                directive.push_str(&d.throttle_allowed.replace("{allowed}", &allowed.join(", ")));
            }
            out.directives.push(directive);

            if let Some(plane) = &r.plane_shift_class
                && out.blocked_classes.contains(plane)
            {
                out.directives.push(d.plane_shift.clone());
            }
        }

        if !closing && every(turn_id, r.question_every_n) {
            out.directives.push(d.question.clone());
        }

        if !closing && r.steelman_every_n > 0 {
            let phase = turn_id % r.steelman_every_n;
            match speaker {
                Speaker::A if phase == r.steelman_a_offset => {
                    out.directives.push(d.steelman_a.clone())
                }
                Speaker::B if phase == r.steelman_b_offset => {
                    out.directives.push(d.steelman_b.clone())
                }
                _ => {}
            }
        }

        if !closing {
            out.suggested_test = self.suggest_test(turn_id, &out.blocked_classes);
            if let Some(test) = &out.suggested_test {
                out.directives.push(d.test_switch.replace("{test}", test));
            }
        }

        if r.obs_interp_block > 0 {
            let block = (turn_id.saturating_sub(1)) / r.obs_interp_block;
            out.directives.push(if block % 2 == 0 {
                d.observations.clone()
            } else {
                d.interpretation.clone()
            });
        }

        if self.beats.is_final_round(turn_id, speaker) {
            out.directives.push(match speaker {
                Speaker::A => d.final_round_a.clone(),
                Speaker::B => d.final_round_b.clone(),
            });
        }

        if closing {
            out.directives.push(d.closing.clone());
        }

        out
    }

    /// Both of the last two lines mention a methodology keyword.
    pub fn is_methodology_loop(&self, history: &[HistoryEntry]) -> bool {
        let Some((last, prev)) = last_two(history) else {
            return false;
        };
        let hit = |text: &str| self.rules.methodology_keywords.iter().any(|k| text.contains(k.as_str()));
        hit(&last) && hit(&prev)
    }

    /// The last two lines share a domain term.
    pub fn is_term_repeat_loop(&self, history: &[HistoryEntry]) -> bool {
        let Some((last, prev)) = last_two(history) else {
            return false;
        };
        self.rules
            .repeat_terms
            .iter()
            .any(|t| last.contains(t.as_str()) && prev.contains(t.as_str()))
    }

    /// The latest line uses every discriminator marker.
    pub fn used_discriminator_phrase(&self, history: &[HistoryEntry]) -> bool {
        let markers = &self.rules.discriminator_markers;
        match history.last() {
            Some(entry) if !markers.is_empty() => {
                let text = entry.text.to_lowercase();
                markers.iter().all(|m| text.contains(m.as_str()))
            }
            _ => false,
        }
    }

    /// Label of the first spec matching `text`.
    pub fn classify_test(&self, text: &str) -> Option<&str> {
        let text = text.to_lowercase();
        self.rules
            .test_classes
            .iter()
            .find(|spec| spec_matches(spec, &text))
            .map(|spec| spec.label.as_str())
    }

    /// Labels of the classified lines inside the throttling window.
    pub fn recent_test_classes(&self, history: &[HistoryEntry]) -> Vec<&str> {
        let window = self.rules.test_class_window;
        let start = if window > 0 {
            history.len().saturating_sub(window)
        } else {
            0
        };
        history[start..]
            .iter()
            .filter_map(|entry| self.classify_test(&entry.text))
            .collect()
    }

    /// Sorted labels used at least `test_class_max` times in the window.
    pub fn blocked_classes(&self, history: &[HistoryEntry]) -> Vec<String> {
        let (window, max) = (self.rules.test_class_window, self.rules.test_class_max);
        if window == 0 || max == 0 {
            return Vec::new();
        }
        let recent = self.recent_test_classes(history);
        let blocked: BTreeSet<&str> = recent
            .iter()
            .copied()
            .filter(|label| recent.iter().filter(|l| *l == label).count() >= max)
            .collect();
        blocked.into_iter().map(str::to_string).collect()
    }

    /// Rotation suggestion on turns `k*N + 1` (k >= 1), skipping blocked labels.
    ///
    /// Returns `None` off-cycle, and also when every entry is blocked.
    fn suggest_test(&self, turn_id: u64, blocked: &[String]) -> Option<String> {
        let n = self.rules.test_switch_every_n;
        let cycle = &self.rules.test_cycle;
        if n == 0 || turn_id <= 1 || turn_id % n != 1 || cycle.is_empty() {
            return None;
        }
        let start = ((turn_id / n) % cycle.len() as u64) as usize;
        (0..cycle.len())
            .map(|i| &cycle[(start + i) % cycle.len()])
            .find(|candidate| !blocked.contains(candidate))
            .cloned()
    }
}

fn every(turn_id: u64, n: u64) -> bool {
    n > 0 && turn_id % n == 0
}

fn last_two(history: &[HistoryEntry]) -> Option<(String, String)> {
    match history {
        [.., prev, last] => Some((last.text.to_lowercase(), prev.text.to_lowercase())),
        _ => None,
    }
}

fn spec_matches(spec: &TestClassSpec, text: &str) -> bool {
    let all_ok = spec.all.iter().all(|k| text.contains(k.as_str()));
    let any_ok = spec.any.is_empty() || spec.any.iter().any(|k| text.contains(k.as_str()));
    all_ok && any_ok
}

fn lowercase_all(items: &mut [String]) {
    for item in items {
        *item = item.to_lowercase();
    }
}
