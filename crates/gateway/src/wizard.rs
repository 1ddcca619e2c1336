//! Step-at-a-time onboarding wizard, driven over RPC.
//!
//! The gateway only hosts the dispatch surface: a wizard session walks a
//! fixed list of steps, records answers, and reports a summary at the end.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::{json, Value};

/// One prompt in the onboarding flow.
struct WizardStep {
    id: &'static str,
    prompt: &'static str,
}

const STEPS: &[WizardStep] = &[
    WizardStep {
        id: "model",
        prompt: "Which model should the assistant use (provider/model)?",
    },
    WizardStep {
        id: "channels",
        prompt: "Which chat channels should be enabled (comma-separated)?",
    },
    WizardStep {
        id: "gatewayAuth",
        prompt: "How should operator clients authenticate (token, password, none)?",
    },
    WizardStep {
        id: "confirm",
        prompt: "Apply this configuration?",
    },
];

struct WizardSession {
    step_index: usize,
    answers: HashMap<String, Value>,
    done: bool,
}

/// In-memory store of active wizard sessions.
#[derive(Default)]
pub struct WizardStore {
    sessions: Mutex<HashMap<String, WizardSession>>,
}

impl WizardStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn step_payload(wizard_id: &str, index: usize) -> Value {
        let step = &STEPS[index];
        json!({
            "wizardId": wizard_id,
            "step": step.id,
            "prompt": step.prompt,
            "stepIndex": index,
            "totalSteps": STEPS.len(),
            "done": false,
        })
    }

    /// Begin a new wizard session; returns the first step.
    pub fn start(&self) -> Value {
        let wizard_id = uuid::Uuid::new_v4().to_string();
        self.sessions.lock().insert(
            wizard_id.clone(),
            WizardSession {
                step_index: 0,
                answers: HashMap::new(),
                done: false,
            },
        );
        Self::step_payload(&wizard_id, 0)
    }

    /// Record the answer for the current step and advance.
    pub fn next(&self, wizard_id: &str, answer: Value) -> Option<Value> {
        let mut sessions = self.sessions.lock();
        let session = sessions.get_mut(wizard_id)?;
        if session.done {
            return Some(json!({"wizardId": wizard_id, "done": true}));
        }

        let step = &STEPS[session.step_index];
        session.answers.insert(step.id.to_owned(), answer);

        if session.step_index + 1 < STEPS.len() {
            session.step_index += 1;
            Some(Self::step_payload(wizard_id, session.step_index))
        } else {
            session.done = true;
            Some(json!({
                "wizardId": wizard_id,
                "done": true,
                "summary": session.answers,
            }))
        }
    }

    /// Abandon a session. Returns whether it existed.
    pub fn cancel(&self, wizard_id: &str) -> bool {
        self.sessions.lock().remove(wizard_id).is_some()
    }

    /// Current position of a session.
    pub fn status(&self, wizard_id: &str) -> Option<Value> {
        let sessions = self.sessions.lock();
        let session = sessions.get(wizard_id)?;
        Some(json!({
            "wizardId": wizard_id,
            "stepIndex": session.step_index,
            "totalSteps": STEPS.len(),
            "done": session.done,
            "answers": session.answers,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_all_steps_to_a_summary() {
        let store = WizardStore::new();
        let first = store.start();
        let wizard_id = first["wizardId"].as_str().unwrap().to_owned();
        assert_eq!(first["step"], "model");

        let mut last = first;
        for answer in ["anthropic/claude-sonnet-4", "telegram", "token", "yes"] {
            last = store.next(&wizard_id, json!(answer)).unwrap();
        }
        assert_eq!(last["done"], true);
        assert_eq!(last["summary"]["model"], "anthropic/claude-sonnet-4");
        assert_eq!(last["summary"]["confirm"], "yes");
    }

    #[test]
    fn cancel_removes_the_session() {
        let store = WizardStore::new();
        let first = store.start();
        let wizard_id = first["wizardId"].as_str().unwrap();

        assert!(store.cancel(wizard_id));
        assert!(!store.cancel(wizard_id));
        assert!(store.next(wizard_id, json!("x")).is_none());
    }

    #[test]
    fn status_reports_progress() {
        let store = WizardStore::new();
        let first = store.start();
        let wizard_id = first["wizardId"].as_str().unwrap().to_owned();
        store.next(&wizard_id, json!("m")).unwrap();

        let status = store.status(&wizard_id).unwrap();
        assert_eq!(status["stepIndex"], 1);
        assert_eq!(status["done"], false);
        assert_eq!(status["answers"]["model"], "m");
    }

    #[test]
    fn unknown_wizard_is_none() {
        let store = WizardStore::new();
        assert!(store.status("ghost").is_none());
        assert!(store.next("ghost", json!(1)).is_none());
    }
}
