//! Data model: `Request`, `Job`, and the value types they're built from.
//!
//! Field names and invariants follow the durable record design the teacher
//! uses for `JobMeta`/`JobState` in `schema.rs`: small, flat, `serde`-derived
//! structs that are equally at home serialized to JSON (for the CLI
//! envelope) and mapped onto SQL columns (for the store).

use serde::{Deserialize, Serialize};

/// Reservation strength for a resource a job touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Shared,
    Exclusive,
}

/// The `{exclusive: [...], shared: [...]}` resource map a job declares.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub exclusive: Vec<String>,
    #[serde(default)]
    pub shared: Vec<String>,
}

impl Resources {
    /// Iterate over every `(name, mode)` pair this job touches.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Mode)> {
        self.exclusive
            .iter()
            .map(|n| (n.as_str(), Mode::Exclusive))
            .chain(self.shared.iter().map(|n| (n.as_str(), Mode::Shared)))
    }

    /// `true` iff no resource name repeats across exclusive and shared.
    pub fn is_valid(&self) -> bool {
        let mut seen = std::collections::HashSet::new();
        self.exclusive.iter().chain(self.shared.iter()).all(|n| seen.insert(n.as_str()))
    }

    /// The first resource name that appears more than once, if any.
    pub fn first_duplicate(&self) -> Option<&str> {
        let mut seen = std::collections::HashSet::new();
        self.exclusive
            .iter()
            .chain(self.shared.iter())
            .find(|n| !seen.insert(n.as_str()))
            .map(|s| s.as_str())
    }
}

/// `TimeSlot` gates dispatch in `ResourceManager::can_start`. Only one slot
/// is defined until a real multi-slot requirement appears (spec open question).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot(pub u8);

impl TimeSlot {
    pub const DEFAULT: TimeSlot = TimeSlot(0);
}

impl Default for TimeSlot {
    fn default() -> Self {
        TimeSlot::DEFAULT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestAction {
    Submit,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestState {
    Pending,
    Completed,
    Failed,
}

/// A user-submitted intent: SUBMIT a new job, or CANCEL an existing one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: i64,
    pub action: RequestAction,
    pub job_type: Option<String>,
    pub parameters: Option<String>,
    pub job_id: Option<i64>,
    pub priority: i32,
    pub start_date: Option<i64>,
    pub time_slot: TimeSlot,
    pub timeout: u64,
    pub submitter: String,
    pub submit_date: i64,
    pub state: RequestState,
    pub result: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Waiting,
    Running,
    CleaningUp,
    Completed,
    Canceled,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Canceled | JobState::Failed)
    }

    pub fn is_active(self) -> bool {
        matches!(self, JobState::Running | JobState::CleaningUp)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Waiting => "WAITING",
            JobState::Running => "RUNNING",
            JobState::CleaningUp => "CLEANINGUP",
            JobState::Completed => "COMPLETED",
            JobState::Canceled => "CANCELED",
            JobState::Failed => "FAILED",
        }
    }
}

/// A durable record of admitted work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub job_type: String,
    pub parameters: String,
    pub resources: Resources,
    pub description: String,
    pub priority: i32,
    pub submit_date: i64,
    pub start_date: Option<i64>,
    pub time_slot: TimeSlot,
    /// 0 means unbounded.
    pub timeout: u64,
    pub state: JobState,
    pub pid: Option<i32>,
    pub start_date_actual: Option<i64>,
    pub end_date: Option<i64>,
    pub result: String,
}

impl Job {
    /// `start_date != None ⇒ timeout > 0`, enforced at construction time.
    pub fn start_date_invariant_holds(&self) -> bool {
        self.start_date.is_none() || self.timeout > 0
    }

    /// The effective start instant used in overlap math: `max(start_date, now)`.
    pub fn effective_start(&self, now: i64) -> i64 {
        self.start_date.map(|s| s.max(now)).unwrap_or(now)
    }

    /// `[start, end)` of this job's reservation, padded by `grace`. `None`
    /// end means open-ended (timeout == 0).
    pub fn reservation_window(&self, now: i64, grace: i64) -> (i64, Option<i64>) {
        let start = self.effective_start(now);
        if self.timeout == 0 {
            (start, None)
        } else {
            (start, Some(start + self.timeout as i64 + grace))
        }
    }

    /// The active job's window is anchored at its actual start time, not `now`.
    pub fn active_window(&self, grace: i64) -> (i64, Option<i64>) {
        let start = self.start_date_actual.unwrap_or(self.submit_date);
        if self.timeout == 0 {
            (start, None)
        } else {
            (start, Some(start + self.timeout as i64 + grace))
        }
    }
}

/// Machine exit codes embedded in the result file (spec §6, result file grammar).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineRc {
    Success,
    Canceled,
    Timeout,
    Exception,
    Other(i32),
}

impl MachineRc {
    pub const CODE_SUCCESS: i32 = 0;
    pub const CODE_CANCELED: i32 = -1;
    pub const CODE_TIMEOUT: i32 = -2;
    pub const CODE_EXCEPTION: i32 = -3;

    pub fn from_code(code: i32) -> Self {
        match code {
            Self::CODE_SUCCESS => MachineRc::Success,
            Self::CODE_CANCELED => MachineRc::Canceled,
            Self::CODE_TIMEOUT => MachineRc::Timeout,
            Self::CODE_EXCEPTION => MachineRc::Exception,
            other => MachineRc::Other(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            MachineRc::Success => Self::CODE_SUCCESS,
            MachineRc::Canceled => Self::CODE_CANCELED,
            MachineRc::Timeout => Self::CODE_TIMEOUT,
            MachineRc::Exception => Self::CODE_EXCEPTION,
            MachineRc::Other(c) => c,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resources_detect_duplicate_across_modes() {
        let r = Resources {
            exclusive: vec!["sys1".into()],
            shared: vec!["sys1".into()],
        };
        assert!(!r.is_valid());
        assert_eq!(r.first_duplicate(), Some("sys1"));
    }

    #[test]
    fn resources_allow_disjoint_names() {
        let r = Resources {
            exclusive: vec!["sys1".into()],
            shared: vec!["sys2".into()],
        };
        assert!(r.is_valid());
    }

    #[test]
    fn start_date_invariant() {
        let mut job = sample_job();
        job.start_date = Some(100);
        job.timeout = 0;
        assert!(!job.start_date_invariant_holds());
        job.timeout = 30;
        assert!(job.start_date_invariant_holds());
    }

    fn sample_job() -> Job {
        Job {
            id: 1,
            job_type: "echo".into(),
            parameters: "{}".into(),
            resources: Resources::default(),
            description: "test".into(),
            priority: 0,
            submit_date: 0,
            start_date: None,
            time_slot: TimeSlot::DEFAULT,
            timeout: 0,
            state: JobState::Waiting,
            pid: None,
            start_date_actual: None,
            end_date: None,
            result: String::new(),
        }
    }
}
