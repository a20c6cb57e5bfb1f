//! State-machine contract (spec §6) and the build-time registry that maps a
//! job type name onto an implementation.
//!
//! Spec §9 explicitly rejects runtime plugin loading for the core: "use a
//! single interface... and a build-time table." `StateMachine` is that
//! interface; `registry()` is the build-time table. Individual state-machine
//! bodies (ansible, power-manager, bulk-op, auto-installer) are out of scope
//! (spec §1) — only `EchoMachine` is provided as a reference implementation,
//! plus a test-only `FlakyMachine` used to exercise timeout/cancel paths.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::model::Resources;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseOutcome {
    pub resources: Resources,
    pub description: String,
}

/// The six-method contract every registered job type must implement.
pub trait StateMachine: Send {
    /// Parse `params` into the resources a job of this type will touch plus
    /// a human-readable description. May fail; the failure message is
    /// surfaced verbatim to the submitter.
    fn parse(&self, params: &str) -> Result<ParseOutcome, String>;

    /// Optional hook to strip secrets out of persisted parameters before
    /// they are written to the job table. Default: no-op.
    fn prefilter(&self, params: &str) -> (String, Option<String>) {
        (params.to_string(), None)
    }

    /// Inverse of `prefilter`, applied just before spawn. Default: ignores
    /// `extra` and returns `params` unchanged.
    fn recombine(&self, params: &str, _extra: Option<&str>) -> String {
        params.to_string()
    }

    /// Run the work. Returns the machine's integer exit code.
    fn start(&mut self, params: &str) -> i32;

    /// Invoked only on interruption (cancel or timeout), in a fresh process.
    fn cleanup(&mut self, params: &str) -> i32;

    /// Whether the machine had already entered its own cleanup path when it
    /// was interrupted; if true, the wrapper does not invoke `cleanup` again.
    fn cleaning_up(&self) -> bool {
        false
    }
}

/// Trivial reference machine: parses
/// `{"message": str, "sleep_secs": u64, "resources": {"exclusive": [...], "shared": [...]}}`,
/// sleeps, returns 0. `resources` defaults to empty when absent, matching
/// spec §6 where `parse` is the sole source of truth for what a job touches.
pub struct EchoMachine {
    cleaning_up: bool,
}

impl EchoMachine {
    pub fn new() -> Self {
        EchoMachine { cleaning_up: false }
    }
}

impl Default for EchoMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct EchoParams {
    #[serde(default)]
    message: String,
    #[serde(default)]
    sleep_secs: u64,
    #[serde(default)]
    resources: Resources,
}

impl StateMachine for EchoMachine {
    fn parse(&self, params: &str) -> Result<ParseOutcome, String> {
        let parsed: EchoParams = serde_json::from_str(params).map_err(|e| e.to_string())?;
        Ok(ParseOutcome {
            resources: parsed.resources,
            description: if parsed.message.is_empty() {
                "No description".to_string()
            } else {
                parsed.message
            },
        })
    }

    fn start(&mut self, params: &str) -> i32 {
        let secs = serde_json::from_str::<EchoParams>(params)
            .map(|p| p.sleep_secs)
            .unwrap_or(0);
        std::thread::sleep(std::time::Duration::from_secs(secs));
        0
    }

    fn cleanup(&mut self, _params: &str) -> i32 {
        self.cleaning_up = true;
        0
    }

    fn cleaning_up(&self) -> bool {
        self.cleaning_up
    }
}

pub type MachineFactory = fn() -> Box<dyn StateMachine>;

fn registry_table() -> &'static HashMap<&'static str, MachineFactory> {
    static TABLE: OnceLock<HashMap<&'static str, MachineFactory>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut m: HashMap<&'static str, MachineFactory> = HashMap::new();
        m.insert("echo", (|| Box::new(EchoMachine::new()) as Box<dyn StateMachine>) as MachineFactory);
        #[cfg(test)]
        m.insert(
            "flaky",
            (|| Box::new(tests::FlakyMachine::default()) as Box<dyn StateMachine>) as MachineFactory,
        );
        m
    })
}

/// Build-time lookup of a state machine by job type name.
pub fn build(job_type: &str) -> Option<Box<dyn StateMachine>> {
    registry_table().get(job_type).map(|f| f())
}

pub fn is_registered(job_type: &str) -> bool {
    registry_table().contains_key(job_type)
}
