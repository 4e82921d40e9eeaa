use crate::plan::{Plan, PlanStep};
use std::collections::{HashSet, VecDeque};

const MAX_ANOMALIES: u32 = 3;
const LOOP_WINDOW: usize = 3;
const KEY_PHRASE_MIN_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyKind {
    /// Reply works on content belonging to a later step.
    SkipAhead,
    /// A write targets a file outside the step's declared scope.
    ScopeDrift,
    /// The same tool-call bag repeated three times in a row.
    Loop,
}

#[derive(Debug, Clone)]
pub struct AnomalyFinding {
    pub kind: AnomalyKind,
    pub message: String,
}

/// Watches model replies for drift from the current step. Findings are
/// advisory; the orchestrator replans after the cumulative threshold.
#[derive(Debug, Default)]
pub struct PlanTracker {
    anomaly_count: u32,
    recent_call_bags: VecDeque<String>,
    replan_attempted: bool,
}

impl PlanTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset_for_plan(&mut self) {
        self.anomaly_count = 0;
        self.recent_call_bags.clear();
        self.replan_attempted = false;
    }

    pub fn anomaly_count(&self) -> u32 {
        self.anomaly_count
    }

    pub fn note_step_completed(&mut self) {
        self.anomaly_count = 0;
    }

    pub fn note_replan(&mut self) {
        self.replan_attempted = true;
        self.anomaly_count = 0;
        self.recent_call_bags.clear();
    }

    pub fn replan_attempted(&self) -> bool {
        self.replan_attempted
    }

    /// Examine one model reply within a step. `calls` are (tool, canonical
    /// argument json) pairs in reply order.
    pub fn observe_reply(
        &mut self,
        plan: &Plan,
        step: &PlanStep,
        assistant_text: &str,
        calls: &[(String, String)],
        focused_paths: &HashSet<String>,
    ) -> Vec<AnomalyFinding> {
        let mut findings = Vec::new();

        if let Some(finding) = self.detect_skip_ahead(plan, step, assistant_text, calls) {
            findings.push(finding);
        }
        if let Some(finding) = detect_scope_drift(step, calls, focused_paths) {
            findings.push(finding);
        }
        if let Some(finding) = self.detect_loop(calls) {
            findings.push(finding);
        }

        if findings.is_empty() {
            self.anomaly_count = 0;
        } else {
            self.anomaly_count += findings.len() as u32;
            if findings.iter().any(|f| f.kind == AnomalyKind::Loop) {
                // A confirmed loop never recovers on its own; treat it as
                // already at the replan threshold.
                self.anomaly_count = self.anomaly_count.max(MAX_ANOMALIES);
            }
            tracing::warn!(
                step_id = step.id,
                anomaly_count = self.anomaly_count,
                findings = findings.len(),
                "anomalies detected in model reply"
            );
        }
        findings
    }

    pub fn should_replan(&self, step_failed: bool) -> bool {
        if self.replan_attempted {
            return false;
        }
        self.anomaly_count >= MAX_ANOMALIES || step_failed
    }

    fn detect_skip_ahead(
        &self,
        plan: &Plan,
        step: &PlanStep,
        assistant_text: &str,
        calls: &[(String, String)],
    ) -> Option<AnomalyFinding> {
        let mut haystack = assistant_text.to_lowercase();
        for (_, args) in calls {
            haystack.push(' ');
            haystack.push_str(&args.to_lowercase());
        }
        let current_phrases = key_phrases(&step.description);

        for later in plan.steps.iter().filter(|s| s.id > step.id) {
            let phrases: Vec<String> = key_phrases(&later.description)
                .into_iter()
                .filter(|p| !current_phrases.contains(p))
                .collect();
            if phrases.is_empty() {
                continue;
            }
            let hits = phrases.iter().filter(|p| haystack.contains(p.as_str())).count();
            if hits >= 2 || (phrases.len() == 1 && hits == 1) {
                return Some(AnomalyFinding {
                    kind: AnomalyKind::SkipAhead,
                    message: format!(
                        "reply works on step {} content ({})",
                        later.id,
                        phrases
                            .into_iter()
                            .take(3)
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                });
            }
        }
        None
    }

    fn detect_loop(&mut self, calls: &[(String, String)]) -> Option<AnomalyFinding> {
        if calls.is_empty() {
            self.recent_call_bags.clear();
            return None;
        }
        let bag = calls
            .iter()
            .map(|(name, args)| format!("{name}({args})"))
            .collect::<Vec<_>>()
            .join(";");
        self.recent_call_bags.push_back(bag);
        while self.recent_call_bags.len() > LOOP_WINDOW {
            self.recent_call_bags.pop_front();
        }
        if self.recent_call_bags.len() == LOOP_WINDOW {
            let first = &self.recent_call_bags[0];
            if self.recent_call_bags.iter().all(|b| b == first) {
                return Some(AnomalyFinding {
                    kind: AnomalyKind::Loop,
                    message: format!("the same tool calls repeated {LOOP_WINDOW} times: {first}"),
                });
            }
        }
        None
    }
}

fn detect_scope_drift(
    step: &PlanStep,
    calls: &[(String, String)],
    focused_paths: &HashSet<String>,
) -> Option<AnomalyFinding> {
    let scope = file_tokens(&format!("{} {}", step.description, step.expected_outcome));
    if scope.is_empty() {
        return None;
    }
    for (name, args) in calls {
        if !matches!(name.as_str(), "write_file" | "patch_file" | "delete_file") {
            continue;
        }
        let Ok(parsed) = serde_json::from_str::<serde_json::Value>(args) else {
            continue;
        };
        let Some(target) = parsed.get("path").and_then(|p| p.as_str()) else {
            continue;
        };
        let in_scope = scope.iter().any(|candidate| {
            target.ends_with(candidate.as_str()) || candidate.ends_with(target)
        });
        if !in_scope && !focused_paths.contains(target) {
            return Some(AnomalyFinding {
                kind: AnomalyKind::ScopeDrift,
                message: format!("{name} targets {target}, outside the step's declared files"),
            });
        }
    }
    None
}

/// Distinctive lowercase words of a step description.
fn key_phrases(text: &str) -> Vec<String> {
    let mut phrases: Vec<String> = text
        .to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_' && c != '.')
        .filter(|w| w.len() >= KEY_PHRASE_MIN_LEN)
        .map(ToOwned::to_owned)
        .collect();
    phrases.sort();
    phrases.dedup();
    phrases
}

/// File-looking tokens mentioned in step text.
fn file_tokens(text: &str) -> Vec<String> {
    text.split(|c: char| c.is_whitespace() || c == ',' || c == ';' || c == '(' || c == ')')
        .map(|w| w.trim_matches(|c: char| c == '`' || c == '\'' || c == '"' || c == ':'))
        .filter(|w| {
            w.rsplit_once('.')
                .is_some_and(|(stem, ext)| {
                    !stem.is_empty()
                        && (1..=5).contains(&ext.len())
                        && ext.chars().all(|c| c.is_ascii_alphanumeric())
                })
        })
        .map(ToOwned::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanStepInput;

    fn plan() -> Plan {
        Plan::new(
            "demo",
            vec![
                PlanStepInput {
                    description: "create the indicator module".to_string(),
                    expected_outcome: Some("indicators.py exists".to_string()),
                    tools_needed: vec!["write_file".to_string()],
                },
                PlanStepInput {
                    description: "implement the backtest engine with portfolio accounting"
                        .to_string(),
                    expected_outcome: None,
                    tools_needed: vec![],
                },
            ],
        )
        .unwrap()
    }

    #[test]
    fn loop_detection_fires_on_third_identical_bag() {
        let plan = plan();
        let step = plan.step(1).unwrap();
        let mut tracker = PlanTracker::new();
        let calls = vec![(
            "read_file".to_string(),
            r#"{"path":"indicators.py"}"#.to_string(),
        )];
        let focused = HashSet::new();

        for round in 0..3 {
            let findings = tracker.observe_reply(&plan, step, "", &calls, &focused);
            let looped = findings.iter().any(|f| f.kind == AnomalyKind::Loop);
            assert_eq!(looped, round == 2, "round {round}");
        }
        assert!(tracker.should_replan(false));
    }

    #[test]
    fn differing_calls_do_not_trip_loop_detection() {
        let plan = plan();
        let step = plan.step(1).unwrap();
        let mut tracker = PlanTracker::new();
        let focused = HashSet::new();

        for i in 0..5 {
            let calls = vec![(
                "read_file".to_string(),
                format!(r#"{{"path":"file{i}.py"}}"#),
            )];
            let findings = tracker.observe_reply(&plan, step, "", &calls, &focused);
            assert!(findings.iter().all(|f| f.kind != AnomalyKind::Loop));
        }
    }

    #[test]
    fn skip_ahead_detects_later_step_phrases() {
        let plan = plan();
        let step = plan.step(1).unwrap();
        let mut tracker = PlanTracker::new();
        let findings = tracker.observe_reply(
            &plan,
            step,
            "Now I will implement the backtest engine and its portfolio accounting.",
            &[],
            &HashSet::new(),
        );
        assert!(findings.iter().any(|f| f.kind == AnomalyKind::SkipAhead));
    }

    #[test]
    fn scope_drift_flags_writes_outside_declared_files() {
        let plan = plan();
        let step = plan.step(1).unwrap();
        let mut tracker = PlanTracker::new();
        let calls = vec![(
            "write_file".to_string(),
            r#"{"path":"unrelated/config.yaml","content":"x"}"#.to_string(),
        )];
        let findings = tracker.observe_reply(&plan, step, "", &calls, &HashSet::new());
        assert!(findings.iter().any(|f| f.kind == AnomalyKind::ScopeDrift));
    }

    #[test]
    fn writes_to_declared_or_focused_files_are_fine() {
        let plan = plan();
        let step = plan.step(1).unwrap();
        let mut tracker = PlanTracker::new();

        let declared = vec![(
            "write_file".to_string(),
            r#"{"path":"indicators.py","content":"x"}"#.to_string(),
        )];
        assert!(tracker
            .observe_reply(&plan, step, "", &declared, &HashSet::new())
            .is_empty());

        let mut focused = HashSet::new();
        focused.insert("helpers.py".to_string());
        let focused_write = vec![(
            "write_file".to_string(),
            r#"{"path":"helpers.py","content":"x"}"#.to_string(),
        )];
        assert!(tracker
            .observe_reply(&plan, step, "", &focused_write, &focused)
            .is_empty());
    }

    #[test]
    fn three_cumulative_anomalies_trigger_replan() {
        let plan = plan();
        let step = plan.step(1).unwrap();
        let mut tracker = PlanTracker::new();
        let drift = vec![(
            "write_file".to_string(),
            r#"{"path":"other/thing.json","content":"x"}"#.to_string(),
        )];
        for _ in 0..3 {
            tracker.observe_reply(&plan, step, "", &drift, &HashSet::new());
        }
        assert!(tracker.should_replan(false));

        tracker.note_replan();
        assert!(!tracker.should_replan(false));
    }
}
