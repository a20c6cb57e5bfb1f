//! Scheduler loop (component E): the single-threaded cooperative loop that
//! drains pending requests, starts eligible jobs, and reaps finished ones.
//!
//! Ported from `tessia/server/scheduler/looper.py`'s `Looper`: `loop`,
//! `_finish_jobs`, `_process_pending_requests`, `_start_jobs`, and
//! `_init_manager`. The three phases run strictly in order every tick, per
//! spec §4.5.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::jobstore::JobDir;
use crate::machine;
use crate::model::{Job, JobState, MachineRc, Mode, Request, RequestAction, RequestState, TimeSlot};
use crate::permissions::{AllowAll, PermissionChecker};
use crate::resources::ResourceManager;
use crate::spawner::{self, PidStatus};
use crate::store::Store;

static SHOULD_RUN: AtomicBool = AtomicBool::new(true);

/// Install handlers that flip `SHOULD_RUN` to false; the loop exits after
/// finishing its current iteration (spec §4.5 startup section).
#[cfg(unix)]
pub fn install_shutdown_handlers() {
    extern "C" fn handler(_sig: libc::c_int) {
        SHOULD_RUN.store(false, Ordering::SeqCst);
    }
    unsafe {
        for sig in [libc::SIGTERM, libc::SIGHUP, libc::SIGINT] {
            libc::signal(sig, handler as libc::sighandler_t);
        }
    }
}

/// Windows has no SIGHUP/SIGINT equivalent wired up here; `Ctrl+C` still
/// raises SIGINT through the C runtime, which `libc::signal` does handle on
/// this platform, so only SIGHUP is dropped.
#[cfg(windows)]
pub fn install_shutdown_handlers() {
    extern "C" fn handler(_sig: libc::c_int) {
        SHOULD_RUN.store(false, Ordering::SeqCst);
    }
    unsafe {
        for sig in [libc::SIGTERM, libc::SIGINT] {
            libc::signal(sig, handler as libc::sighandler_t);
        }
    }
}

fn now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

pub struct Looper {
    store: Store,
    resources: ResourceManager,
    permissions: Box<dyn PermissionChecker>,
    jobs_dir: PathBuf,
    slot: TimeSlot,
    max_unknown_retries: u32,
    unknown_retry_counts: std::collections::HashMap<i64, u32>,
    own_cwd: PathBuf,
}

impl Looper {
    pub fn new(config: &Config, store: Store) -> anyhow::Result<Self> {
        Self::with_permissions(config, store, Box::new(AllowAll))
    }

    /// Construct with a non-default permission collaborator (spec §6's
    /// "external collaborator... not internals" — the core only depends on
    /// the `PermissionChecker` trait).
    pub fn with_permissions(config: &Config, store: Store, permissions: Box<dyn PermissionChecker>) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.jobs_dir)?;
        let own_cwd = std::env::current_dir()?;
        let mut looper = Looper {
            store,
            resources: ResourceManager::new(config.grace_seconds),
            permissions,
            jobs_dir: config.jobs_dir.clone(),
            slot: TimeSlot::DEFAULT,
            max_unknown_retries: config.max_unknown_retries,
            unknown_retry_counts: std::collections::HashMap::new(),
            own_cwd,
        };
        looper.init_manager()?;
        Ok(looper)
    }

    /// Startup recovery: rebuild the in-memory resource manager from the
    /// job table (spec §4.5 "Startup / recovery").
    fn init_manager(&mut self) -> anyhow::Result<()> {
        for job in self.store.nonterminal_jobs()? {
            if job.resources.exclusive.is_empty() && job.resources.shared.is_empty() {
                warn!(job.id, "recovered job has no resources; skipping (inconsistency)");
                continue;
            }
            match job.state {
                JobState::Waiting => {
                    self.resources.remember(job.clone());
                    self.resources.enqueue(job);
                }
                JobState::Running | JobState::CleaningUp => {
                    let job_dir = JobDir::open(&self.jobs_dir, job.id)?;
                    let status = job
                        .pid
                        .map(|pid| spawner::validate_job(pid, &job_dir, &self.own_cwd))
                        .unwrap_or(PidStatus::Dead);
                    if status == PidStatus::Dead {
                        self.post_process_job(job)?;
                    } else {
                        self.resources.remember(job.clone());
                        self.resources.set_active(job);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn should_run(&self) -> bool {
        SHOULD_RUN.load(Ordering::SeqCst)
    }

    /// Run one tick: finish_jobs → process_pending_requests → start_jobs.
    pub fn tick(&mut self) -> anyhow::Result<()> {
        self.finish_jobs()?;
        self.process_pending_requests()?;
        self.start_jobs()?;
        Ok(())
    }

    // ---- Phase 1 ----

    fn finish_jobs(&mut self) -> anyhow::Result<()> {
        let active: Vec<Job> = self
            .store
            .nonterminal_jobs()?
            .into_iter()
            .filter(|j| j.state.is_active())
            .collect();
        for job in active {
            let job_dir = JobDir::open(&self.jobs_dir, job.id)?;
            let status = match job.pid {
                Some(pid) => spawner::validate_job(pid, &job_dir, &self.own_cwd),
                None => PidStatus::Dead,
            };
            match status {
                PidStatus::Dead => self.post_process_job(job)?,
                PidStatus::Unknown => {
                    let count = self.unknown_retry_counts.entry(job.id).or_insert(0);
                    *count += 1;
                    if *count >= self.max_unknown_retries {
                        warn!(job.id, retries = *count, "UNKNOWN pid exceeded retry cap; forcing DEAD");
                        self.unknown_retry_counts.remove(&job.id);
                        self.post_process_job(job)?;
                    }
                }
                PidStatus::Running => {
                    self.unknown_retry_counts.remove(&job.id);
                }
            }
        }
        Ok(())
    }

    fn post_process_job(&mut self, mut job: Job) -> anyhow::Result<()> {
        let job_dir = JobDir::open(&self.jobs_dir, job.id)?;
        let result = job_dir.read_result()?;
        let ts = now();

        let (state, message) = match result {
            None => (JobState::Failed, "Job ended in unknown state.".to_string()),
            Some(r) => match MachineRc::from_code(r.machine_rc) {
                MachineRc::Success => (JobState::Completed, "Job finished successfully.".to_string()),
                MachineRc::Canceled | MachineRc::Timeout => {
                    let label = if matches!(MachineRc::from_code(r.machine_rc), MachineRc::Timeout) {
                        "Job timed out."
                    } else {
                        "Job canceled by user."
                    };
                    let cleanup_note = match r.cleanup_rc {
                        Some(0) => " Cleanup completed.",
                        Some(_) => " Cleanup failed.",
                        None => " Cleanup did not run.",
                    };
                    (JobState::Canceled, format!("{label}{cleanup_note}"))
                }
                MachineRc::Exception => (JobState::Failed, "Job failed abnormally.".to_string()),
                MachineRc::Other(_) => (JobState::Failed, "Job ended with error exit code.".to_string()),
            },
        };

        job.state = state;
        job.result = message;
        job.end_date = Some(ts);
        self.store.update_job(&job)?;
        self.resources.active_pop(job.id);
        Ok(())
    }

    // ---- Phase 2 ----

    fn process_pending_requests(&mut self) -> anyhow::Result<()> {
        for req in self.store.pending_requests_ordered()? {
            match req.action {
                RequestAction::Cancel => self.process_cancel(req)?,
                RequestAction::Submit => self.process_submit(req)?,
            }
        }
        Ok(())
    }

    fn process_cancel(&mut self, mut req: Request) -> anyhow::Result<()> {
        let Some(job_id) = req.job_id else {
            req.state = RequestState::Failed;
            req.result = "Specified job not found".into();
            self.store.update_request(&req)?;
            return Ok(());
        };
        let mut job = match self.store.get_job(job_id) {
            Ok(j) => j,
            Err(_) => {
                req.state = RequestState::Failed;
                req.result = "Specified job not found".into();
                self.store.update_request(&req)?;
                return Ok(());
            }
        };

        if job.state.is_terminal() {
            req.state = RequestState::Failed;
            req.result = "Cannot cancel job because it already ended".into();
            self.store.update_request(&req)?;
            return Ok(());
        }

        if job.state.is_active() {
            let job_dir = JobDir::open(&self.jobs_dir, job.id)?;
            let status = match job.pid {
                Some(pid) => spawner::validate_job(pid, &job_dir, &self.own_cwd),
                None => PidStatus::Dead,
            };
            match status {
                PidStatus::Dead => {
                    req.state = RequestState::Failed;
                    req.result = "Job has ended while processing request".into();
                    self.store.update_request(&req)?;
                    self.post_process_job(job)?;
                    return Ok(());
                }
                PidStatus::Unknown => {
                    warn!(job.id, "cancel target is in UNKNOWN state; retrying next tick");
                    return Ok(());
                }
                PidStatus::Running => {}
            }

            if job.state == JobState::Running {
                if let Some(pid) = job.pid {
                    spawner::terminate(pid, false);
                }
                job.state = JobState::CleaningUp;
                job.result = "Job canceled by user; cleaning up".into();
                self.store.update_job(&job)?;
                req.state = RequestState::Completed;
                self.store.update_request(&req)?;
            } else {
                if let Some(pid) = job.pid {
                    spawner::terminate(pid, true);
                }
                job.state = JobState::Canceled;
                job.end_date = Some(now());
                self.store.update_job(&job)?;
                self.resources.active_pop(job.id);
                req.state = RequestState::Completed;
                self.store.update_request(&req)?;
            }
            return Ok(());
        }

        // WAITING
        job.state = JobState::Canceled;
        job.end_date = Some(now());
        self.store.update_job(&job)?;
        self.resources.wait_pop(job.id);
        req.state = RequestState::Completed;
        self.store.update_request(&req)?;
        Ok(())
    }

    fn process_submit(&mut self, mut req: Request) -> anyhow::Result<()> {
        let fail = |req: &mut Request, store: &Store, msg: String| -> anyhow::Result<()> {
            req.state = RequestState::Failed;
            req.result = msg;
            store.update_request(req)?;
            Ok(())
        };

        let Some(job_type) = req.job_type.clone() else {
            return fail(&mut req, &self.store, "Request is missing a job type".into());
        };
        if !machine::is_registered(&job_type) {
            return fail(&mut req, &self.store, format!("Unknown job type {job_type:?}"));
        }
        let params = req.parameters.clone().unwrap_or_default();
        let machine = machine::build(&job_type).expect("registered");
        let outcome = match machine.parse(&params) {
            Ok(o) => o,
            Err(e) => return fail(&mut req, &self.store, e),
        };

        if !outcome.resources.is_valid() {
            let dup = outcome.resources.first_duplicate().unwrap_or("").to_string();
            return fail(&mut req, &self.store, format!("resource {dup:?} listed more than once"));
        }

        // Only exclusive resources are permission-gated, and with the UPDATE
        // action — shared resources and every other action are a submitter's
        // own business (spec §4.5 Phase 2 step 5).
        for resource in &outcome.resources.exclusive {
            if let Err(e) = self.permissions.can("update", &req.submitter, resource, Mode::Exclusive) {
                return fail(&mut req, &self.store, format!("{e} on resource {resource:?}"));
            }
        }

        if req.start_date.is_some() && req.timeout == 0 {
            return fail(&mut req, &self.store, "start_date set without a positive timeout".into());
        }

        let job = Job {
            id: 0,
            job_type,
            parameters: params,
            resources: outcome.resources,
            description: if outcome.description.is_empty() {
                "No description".into()
            } else {
                outcome.description
            },
            priority: req.priority,
            submit_date: req.submit_date,
            start_date: req.start_date,
            time_slot: req.time_slot,
            timeout: req.timeout,
            state: JobState::Waiting,
            pid: None,
            start_date_actual: None,
            end_date: None,
            result: "Waiting for resources".into(),
        };

        if !self.resources.can_enqueue(&job, now()) {
            return fail(&mut req, &self.store, "Job would conflict with another scheduled job.".into());
        }

        let job_id = self.store.insert_job(&job)?;
        let job = Job { id: job_id, ..job };
        req.job_id = Some(job_id);
        req.state = RequestState::Completed;
        req.result = "Job submitted".into();
        self.store.update_request(&req)?;
        self.resources.enqueue(job);
        Ok(())
    }

    // ---- Phase 3 ----

    fn start_jobs(&mut self) -> anyhow::Result<()> {
        let waiting: Vec<Job> = self
            .store
            .nonterminal_jobs()?
            .into_iter()
            .filter(|j| j.state == JobState::Waiting)
            .collect();
        let now_ts = now();
        for mut job in waiting {
            if !self.resources.can_start(&job, now_ts, self.slot)? {
                continue;
            }
            let job_dir = JobDir::open(&self.jobs_dir, job.id)?;
            match spawner::spawn(job.id, &job_dir.path, &job.job_type, &job.parameters, job.timeout) {
                Ok(pid) => {
                    job.pid = Some(pid);
                    job.state = JobState::Running;
                    job.result = "Job is running".into();
                    job.start_date_actual = Some(now_ts);
                    self.store.update_job(&job)?;
                    self.resources.wait_pop(job.id);
                    let job_id = job.id;
                    self.resources.set_active(job);
                    debug!(job.id = job_id, pid, "job started");
                }
                Err(e) => {
                    warn!(job.id, error = %e, "spawn failed");
                    job.state = JobState::Failed;
                    job.start_date_actual = Some(now_ts);
                    job.end_date = Some(now_ts);
                    job.result = format!("Spawn failed: {e}");
                    self.store.update_job(&job)?;
                    self.resources.wait_pop(job.id);
                }
            }
        }
        Ok(())
    }
}

/// Run the scheduler daemon: tick forever at `tick_interval_ms` until a
/// shutdown signal is received (spec §4.5).
pub fn run_daemon(config: &Config) -> anyhow::Result<()> {
    install_shutdown_handlers();
    let store = Store::open(&config.db_url)?;
    let mut looper = Looper::new(config, store)?;
    info!(jobs_dir = %config.jobs_dir.display(), "scheduler starting");
    while looper.should_run() {
        looper.tick()?;
        std::thread::sleep(std::time::Duration::from_millis(config.tick_interval_ms));
    }
    info!("scheduler shutting down");
    Ok(())
}

/// Enqueue a new SUBMIT request; used by the `jobctl submit` CLI command.
pub fn submit_request(
    store: &Store,
    job_type: &str,
    parameters: &str,
    priority: i32,
    start_date: Option<i64>,
    timeout: u64,
    submitter: &str,
) -> anyhow::Result<i64> {
    let req = Request {
        id: 0,
        action: RequestAction::Submit,
        job_type: Some(job_type.to_string()),
        parameters: Some(parameters.to_string()),
        job_id: None,
        priority,
        start_date,
        time_slot: TimeSlot::DEFAULT,
        timeout,
        submitter: submitter.to_string(),
        submit_date: now(),
        state: RequestState::Pending,
        result: String::new(),
    };
    Ok(store.insert_request(&req)?)
}

/// Enqueue a new CANCEL request; used by the `jobctl cancel` CLI command.
pub fn cancel_request(store: &Store, job_id: i64, submitter: &str) -> anyhow::Result<i64> {
    let req = Request {
        id: 0,
        action: RequestAction::Cancel,
        job_type: None,
        parameters: None,
        job_id: Some(job_id),
        priority: 0,
        start_date: None,
        time_slot: TimeSlot::DEFAULT,
        timeout: 0,
        submitter: submitter.to_string(),
        submit_date: now(),
        state: RequestState::Pending,
        result: String::new(),
    };
    Ok(store.insert_request(&req)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            db_url: ":memory:".into(),
            jobs_dir: dir.to_path_buf(),
            log_level: "INFO".into(),
            grace_seconds: 300,
            tick_interval_ms: 10,
            max_unknown_retries: 3,
        }
    }

    #[test]
    fn submit_then_tick_starts_echo_job() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let store = Store::open(&config.db_url).unwrap();
        submit_request(&store, "echo", r#"{"message":"hi","sleep_secs":0}"#, 0, None, 0, "alice").unwrap();

        let mut looper = Looper::new(&config, store).unwrap();
        looper.tick().unwrap();

        let job = looper.store.get_job(1).unwrap();
        assert_eq!(job.state, JobState::Running);
    }

    #[test]
    fn unknown_job_type_fails_request_without_crashing() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let store = Store::open(&config.db_url).unwrap();
        submit_request(&store, "nonexistent", "{}", 0, None, 0, "alice").unwrap();

        let mut looper = Looper::new(&config, store).unwrap();
        looper.tick().unwrap();

        let req = looper.store.get_request(1).unwrap();
        assert_eq!(req.state, RequestState::Failed);
    }

    #[test]
    fn duplicate_resource_request_fails_via_submit_flow() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let store = Store::open(&config.db_url).unwrap();
        submit_request(
            &store,
            "echo",
            r#"{"resources":{"exclusive":["sys1"],"shared":["sys1"]}}"#,
            0,
            None,
            0,
            "alice",
        )
        .unwrap();

        let mut looper = Looper::new(&config, store).unwrap();
        looper.tick().unwrap();

        let req = looper.store.get_request(1).unwrap();
        assert_eq!(req.state, RequestState::Failed);
        assert!(req.result.contains("sys1"));
    }

    #[test]
    fn permission_denial_fails_the_request_without_creating_a_job() {
        struct DenyAll;
        impl crate::permissions::PermissionChecker for DenyAll {
            fn can(
                &self,
                _action: &str,
                _requester: &str,
                _resource: &str,
                _mode: crate::model::Mode,
            ) -> Result<(), crate::permissions::PermissionError> {
                Err(crate::permissions::PermissionError::Denied)
            }
        }

        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let store = Store::open(&config.db_url).unwrap();
        submit_request(
            &store,
            "echo",
            r#"{"resources":{"exclusive":["sys1"]}}"#,
            0,
            None,
            0,
            "alice",
        )
        .unwrap();

        let mut looper = Looper::with_permissions(&config, store, Box::new(DenyAll)).unwrap();
        looper.tick().unwrap();

        let req = looper.store.get_request(1).unwrap();
        assert_eq!(req.state, RequestState::Failed);
        assert!(looper.store.get_job(1).is_err());
    }

    #[test]
    fn cancel_of_waiting_job_is_immediate() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let store = Store::open(&config.db_url).unwrap();
        // Block sys1 first with a long-running exclusive holder so our
        // target stays WAITING behind it.
        submit_request(
            &store,
            "echo",
            r#"{"sleep_secs":60,"resources":{"exclusive":["sys1"]}}"#,
            0,
            None,
            300,
            "alice",
        )
        .unwrap();
        let mut looper = Looper::new(&config, store).unwrap();
        looper.tick().unwrap();

        submit_request(
            &looper.store,
            "echo",
            r#"{"sleep_secs":1,"resources":{"exclusive":["sys1"]}}"#,
            0,
            None,
            10,
            "bob",
        )
        .unwrap();
        looper.tick().unwrap();
        let target = looper.store.get_job(2).unwrap();
        assert_eq!(target.state, JobState::Waiting);

        cancel_request(&looper.store, 2, "bob").unwrap();
        looper.tick().unwrap();
        let target = looper.store.get_job(2).unwrap();
        assert_eq!(target.state, JobState::Canceled);
    }
}
