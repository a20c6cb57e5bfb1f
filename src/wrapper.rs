//! Wrapper (component B): the worker-side lifecycle that runs inside the
//! spawned child process.
//!
//! Ported from `tessia/server/scheduler/wrapper.py`'s `MachineWrapper`. The
//! Python original relies on raising `WrapperCanceled`/`WrapperTimeout`
//! exceptions from a signal handler and re-execing the interpreter for
//! cleanup (spec §4.2, §9). This port uses the same two-process design but
//! expressed with Rust primitives: a `Cancel` flag set from a Unix signal
//! handler (a watchdog thread stands in for the timeout alarm on Windows,
//! which has no `SIGALRM`) that a polling loop watches while `start()` runs
//! on its own thread — the state machine body itself is *not* required to
//! check it; an interrupted machine is simply abandoned rather than joined,
//! and a clean child-process spawn replaces `execv` for cleanup re-exec.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::WrapperError;
use crate::json_stream::JsonStream;
use crate::machine::{self, StateMachine};
use crate::model::MachineRc;

pub const WORKER_COMM: &str = "jobctl-worker";
pub const CLEANUP_TIME_SECS: u32 = 60;

/// The request a spawned worker reads as a single JSON object over its own
/// stdin (spec §1, component A). Field names mirror `exec.py`'s
/// `REQUEST_SCHEMA`: `job_dir`, `job_type`, `job_parameters`, `timeout`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub job_id: i64,
    pub job_dir: PathBuf,
    pub job_type: String,
    pub job_parameters: String,
    pub timeout: u64,
}

/// Read one JSON object off `reader` via the streaming decoder and validate
/// it has every field `REQUEST_SCHEMA` requires.
fn decode_worker_request<R: Read>(reader: R) -> Result<WorkerRequest> {
    let mut stream = JsonStream::new(reader);
    let value = stream
        .next_value()
        .context("decoding worker request from stdin")?
        .context("worker request stream is empty")?;
    serde_json::from_value(value).context("worker request is missing a required field")
}

/// Read one JSON object off `reader` via the streaming decoder, validate it
/// has every required field, and run the worker lifecycle.
pub fn run_worker_from_reader<R: Read>(reader: R) -> Result<i32> {
    let request = decode_worker_request(reader)?;
    run(request.job_id, &request.job_dir, &request.job_type, &request.job_parameters, request.timeout)
}

static CANCELED: AtomicBool = AtomicBool::new(false);
static TIMED_OUT: AtomicBool = AtomicBool::new(false);
/// Set to 1 right before disarming signals/alarm; a handler that fires after
/// this is set must be a no-op (spec §4.2 step 4 — `alarm(0)` does not
/// prevent an already in-flight delivery).
static MASKED: AtomicI32 = AtomicI32::new(0);

#[cfg(unix)]
extern "C" fn handle_cancel_signal(_sig: libc::c_int) {
    if MASKED.load(Ordering::SeqCst) != 0 {
        return;
    }
    CANCELED.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
extern "C" fn handle_alarm_signal(_sig: libc::c_int) {
    if MASKED.load(Ordering::SeqCst) != 0 {
        return;
    }
    TIMED_OUT.store(true, Ordering::SeqCst);
}

/// Check `MASKED` and raise `TIMED_OUT` exactly the way the Unix `SIGALRM`
/// handler does, so a watchdog thread that wakes just after `suppress_signals`
/// has already run is as much a no-op as a signal delivered in that window.
#[cfg(windows)]
fn mark_timed_out_unless_masked() {
    if MASKED.load(Ordering::SeqCst) == 0 {
        TIMED_OUT.store(true, Ordering::SeqCst);
    }
}

/// The classification the wrapper settled on when it was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interruption {
    Canceled,
    TimedOut,
}

/// Parameters crossing the re-exec boundary into the cleanup subcommand.
/// Written to `wrapper_init_parameters` as a single-line JSON object (spec
/// §9: "any portable format... works").
#[derive(Debug, Serialize, Deserialize)]
pub struct CleanupParameters {
    pub job_id: i64,
    pub job_type: String,
    pub params: String,
    pub job_dir: PathBuf,
    pub pre_classified_rc: i32,
}

/// Three-line result file contents (spec §3, §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultFile {
    pub machine_rc: i32,
    pub cleanup_rc: Option<i32>,
    pub end_timestamp: String,
}

impl ResultFile {
    pub fn render(&self) -> String {
        match self.cleanup_rc {
            Some(c) => format!("{}\n{}\n{}\n", self.machine_rc, c, self.end_timestamp),
            None => format!("{}\n{}\n", self.machine_rc, self.end_timestamp),
        }
    }

    pub fn parse(raw: &str) -> Result<ResultFile> {
        let lines: Vec<&str> = raw.lines().collect();
        match lines.as_slice() {
            [rc, ts] => Ok(ResultFile {
                machine_rc: rc.parse().context("result file line 1 is not an integer")?,
                cleanup_rc: None,
                end_timestamp: ts.to_string(),
            }),
            [rc, crc, ts] => Ok(ResultFile {
                machine_rc: rc.parse().context("result file line 1 is not an integer")?,
                cleanup_rc: Some(crc.parse().context("result file line 2 is not an integer")?),
                end_timestamp: ts.to_string(),
            }),
            _ => anyhow::bail!("malformed result file: expected 2 or 3 lines, got {}", lines.len()),
        }
    }
}

fn now_timestamp() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    crate::timefmt::format_utc(secs as i64)
}

/// Write `WORKER_COMM` somewhere the spawner can read it back. On Linux this
/// is `prctl(PR_SET_NAME, ...)`, which is reflected in `/proc/<pid>/comm`;
/// elsewhere it is a handshake file (spec §9).
fn write_comm(job_dir: &Path) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        let name = std::ffi::CString::new(WORKER_COMM).unwrap();
        unsafe {
            libc::prctl(libc::PR_SET_NAME, name.as_ptr() as libc::c_ulong, 0, 0, 0);
        }
    }
    let handshake = job_dir.join(".worker_handshake");
    std::fs::write(&handshake, format!("{WORKER_COMM}\n{}\n", std::process::id()))
        .with_context(|| format!("writing handshake file {}", handshake.display()))?;
    Ok(())
}

fn redirect_output(job_dir: &Path) -> Result<(), WrapperError> {
    let output_path = job_dir.join("output");
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&output_path)
        .map_err(|e| WrapperError::RedirectFailed(output_path.clone(), e))?;
    #[cfg(unix)]
    {
        use std::os::fd::AsRawFd;
        let fd = file.as_raw_fd();
        unsafe {
            libc::dup2(fd, libc::STDOUT_FILENO);
            libc::dup2(fd, libc::STDERR_FILENO);
        }
    }
    std::mem::forget(file);
    Ok(())
}

#[cfg(unix)]
fn install_handlers(timeout: u64) {
    unsafe {
        for sig in [libc::SIGTERM, libc::SIGHUP, libc::SIGINT] {
            libc::signal(sig, handle_cancel_signal as libc::sighandler_t);
        }
        if timeout > 0 {
            libc::signal(libc::SIGALRM, handle_alarm_signal as libc::sighandler_t);
            libc::alarm(timeout as libc::c_uint);
        }
    }
}

/// Windows has no signal the scheduler can deliver cooperatively — its
/// `spawner::terminate` maps straight to `TerminateProcess`, so `CANCELED`
/// is unreachable here and is left unset. The timeout is instead a watchdog
/// thread that raises `TIMED_OUT` the way `SIGALRM` would.
#[cfg(windows)]
fn install_handlers(timeout: u64) {
    if timeout > 0 {
        arm_watchdog(timeout);
    }
}

#[cfg(windows)]
fn arm_watchdog(secs: u64) {
    std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_secs(secs));
        mark_timed_out_unless_masked();
    });
}

/// Set both cancel handlers and SIGALRM to ignore, disarm any pending alarm,
/// and mask future deliveries (spec §4.2 step 4).
#[cfg(unix)]
fn suppress_signals() {
    MASKED.store(1, Ordering::SeqCst);
    unsafe {
        libc::alarm(0);
        for sig in [libc::SIGTERM, libc::SIGHUP, libc::SIGINT, libc::SIGALRM] {
            libc::signal(sig, libc::SIG_IGN);
        }
    }
}

/// There's no alarm to disarm; a watchdog thread already in flight checks
/// `MASKED` itself before raising `TIMED_OUT`.
#[cfg(windows)]
fn suppress_signals() {
    MASKED.store(1, Ordering::SeqCst);
}

fn write_result(job_id: i64, job_dir: &Path, result: &ResultFile) -> Result<(), WrapperError> {
    let path = job_dir.join(format!(".{job_id}"));
    let mut file = std::fs::File::create(&path).map_err(|e| WrapperError::ResultWriteFailed(path.clone(), e))?;
    file.write_all(result.render().as_bytes())
        .map_err(|e| WrapperError::ResultWriteFailed(path.clone(), e))?;
    Ok(())
}

/// Run `machine.start(params)` to completion, or abandon it the moment
/// `CANCELED`/`TIMED_OUT` is raised instead of blocking until it returns on
/// its own (spec §8 scenario 5: a 60s-sleeping machine under a 5s timeout
/// must reclassify at ~5s, not at 60s). The machine runs on its own thread;
/// an interruption leaves that thread running detached rather than joined,
/// since `StateMachine` bodies aren't required to poll for cancellation
/// themselves (only the process-level signal contract is, per spec §4.2).
/// Returns `(interruption, machine_rc, cleaning_up)` — `cleaning_up` is only
/// meaningful when the machine finished naturally before any interruption;
/// an abandoned machine is assumed not to have reached its own cleanup path
/// yet, which matches every shipped machine's behavior (the flag is only
/// ever set from inside `cleanup()`, never from `start()`).
fn run_machine_with_deadline(mut machine: Box<dyn StateMachine>, params: &str) -> (Option<Interruption>, i32, bool) {
    let (tx, rx) = std::sync::mpsc::channel();
    let params = params.to_string();
    let spawned = std::thread::Builder::new().spawn(move || {
        let rc = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| machine.start(&params)))
            .unwrap_or(MachineRc::Exception.code());
        let cleaning_up = machine.cleaning_up();
        let _ = tx.send((rc, cleaning_up));
    });
    if spawned.is_err() {
        return (None, MachineRc::Exception.code(), false);
    }

    const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(50);
    loop {
        if CANCELED.load(Ordering::SeqCst) {
            return (Some(Interruption::Canceled), MachineRc::Canceled.code(), false);
        }
        if TIMED_OUT.load(Ordering::SeqCst) {
            return (Some(Interruption::TimedOut), MachineRc::Timeout.code(), false);
        }
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok((rc, cleaning_up)) => return (None, rc, cleaning_up),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return (None, MachineRc::Exception.code(), false),
        }
    }
}

/// Run the full worker lifecycle: chdir into the job directory, redirect
/// output, install handlers, run the machine, write the result file or hand
/// off to cleanup (spec §4.2 step 1: "create if missing, chdir into it" —
/// `job_dir` must already exist; the caller creates it via `JobDir::open`,
/// whose canonicalized path keeps later path joins valid after this chdir).
pub fn run(job_id: i64, job_dir: &Path, job_type: &str, params: &str, timeout: u64) -> Result<i32> {
    std::env::set_current_dir(job_dir).map_err(|e| WrapperError::ChdirFailed(job_dir.to_path_buf(), e))?;

    write_comm(job_dir)?;
    redirect_output(job_dir)?;

    let machine = machine::build(job_type).ok_or_else(|| WrapperError::UnknownJobType(job_type.to_string()))?;

    install_handlers(timeout);

    let (interruption, machine_rc, cleaning_up) = run_machine_with_deadline(machine, params);

    suppress_signals();

    match interruption {
        None => {
            write_result(
                job_id,
                job_dir,
                &ResultFile {
                    machine_rc,
                    cleanup_rc: None,
                    end_timestamp: now_timestamp(),
                },
            )?;
            Ok(machine_rc)
        }
        Some(_) if cleaning_up => {
            write_result(
                job_id,
                job_dir,
                &ResultFile {
                    machine_rc,
                    cleanup_rc: None,
                    end_timestamp: now_timestamp(),
                },
            )?;
            Ok(machine_rc)
        }
        Some(_) => {
            let params_path = job_dir.join("wrapper_init_parameters");
            let handoff = CleanupParameters {
                job_id,
                job_type: job_type.to_string(),
                params: params.to_string(),
                job_dir: job_dir.to_path_buf(),
                pre_classified_rc: machine_rc,
            };
            std::fs::write(&params_path, serde_json::to_string(&handoff)?)
                .with_context(|| format!("writing cleanup handoff file {}", params_path.display()))?;
            exec_cleanup(job_id, &params_path)
        }
    }
}

#[cfg(unix)]
fn arm_cleanup_timeout() {
    unsafe {
        libc::signal(libc::SIGALRM, handle_alarm_signal as libc::sighandler_t);
        libc::alarm(CLEANUP_TIME_SECS);
    }
}

#[cfg(windows)]
fn arm_cleanup_timeout() {
    arm_watchdog(CLEANUP_TIME_SECS as u64);
}

/// Spawn the cleanup subcommand as a fresh process image and wait for it.
/// Mirrors `os.execv` in the Python original but as a clean child spawn
/// (spec §9: "do not attempt to run cleanup in the same address space").
fn exec_cleanup(_job_id: i64, params_path: &Path) -> Result<i32> {
    let exe = std::env::current_exe().context("resolving own executable path for cleanup re-exec")?;
    let status = std::process::Command::new(exe)
        .arg("_cleanup")
        .arg(params_path)
        .status()
        .context("spawning cleanup subprocess")?;
    Ok(status.code().unwrap_or(MachineRc::Exception.code()))
}

/// Entry point for the `_cleanup` subcommand: read the handoff file, run
/// `cleanup()` with a bounded alarm, write the two-rc result file.
pub fn run_cleanup(params_path: &Path) -> Result<i32> {
    let raw = std::fs::read_to_string(params_path).context("reading cleanup handoff file")?;
    let handoff: CleanupParameters = serde_json::from_str(&raw).context("parsing cleanup handoff file")?;

    let mut machine =
        machine::build(&handoff.job_type).ok_or_else(|| WrapperError::UnknownJobType(handoff.job_type.clone()))?;

    TIMED_OUT.store(false, Ordering::SeqCst);
    MASKED.store(0, Ordering::SeqCst);
    arm_cleanup_timeout();

    let cleanup_rc = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| machine.cleanup(&handoff.params)))
        .unwrap_or(MachineRc::Exception.code());
    let cleanup_rc = if TIMED_OUT.load(Ordering::SeqCst) {
        MachineRc::Timeout.code()
    } else {
        cleanup_rc
    };

    suppress_signals();

    write_result(
        handoff.job_id,
        &handoff.job_dir,
        &ResultFile {
            machine_rc: handoff.pre_classified_rc,
            cleanup_rc: Some(cleanup_rc),
            end_timestamp: now_timestamp(),
        },
    )?;
    let _ = std::fs::remove_file(params_path);
    Ok(cleanup_rc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_file_round_trips_two_line() {
        let r = ResultFile {
            machine_rc: 0,
            cleanup_rc: None,
            end_timestamp: "2026-08-01 00:00:00:000000".into(),
        };
        let rendered = r.render();
        assert_eq!(ResultFile::parse(&rendered).unwrap(), r);
    }

    #[test]
    fn result_file_round_trips_three_line() {
        let r = ResultFile {
            machine_rc: -2,
            cleanup_rc: Some(0),
            end_timestamp: "2026-08-01 00:00:00:000000".into(),
        };
        let rendered = r.render();
        assert_eq!(rendered.lines().count(), 3);
        assert_eq!(ResultFile::parse(&rendered).unwrap(), r);
    }

    #[test]
    fn result_file_rejects_malformed_line_count() {
        assert!(ResultFile::parse("only-one-line").is_err());
    }

    #[test]
    fn decodes_worker_request_from_stdin_shaped_json() {
        let payload = serde_json::json!({
            "job_id": 7,
            "job_dir": "/tmp/jobs/7",
            "job_type": "echo",
            "job_parameters": "{\"message\":\"hi\"}",
            "timeout": 30,
        });
        let bytes = serde_json::to_vec(&payload).unwrap();
        let request = decode_worker_request(bytes.as_slice()).unwrap();
        assert_eq!(request.job_id, 7);
        assert_eq!(request.job_dir, Path::new("/tmp/jobs/7"));
        assert_eq!(request.timeout, 30);
    }

    #[test]
    fn rejects_worker_request_missing_a_required_field() {
        let payload = serde_json::json!({"job_id": 1, "job_dir": "/tmp/jobs/1", "job_type": "echo"});
        let bytes = serde_json::to_vec(&payload).unwrap();
        assert!(decode_worker_request(bytes.as_slice()).is_err());
    }

    #[test]
    fn rejects_empty_stdin() {
        assert!(decode_worker_request(b"".as_slice()).is_err());
    }

    #[test]
    #[cfg(unix)]
    fn alarm_after_mask_is_a_noop() {
        TIMED_OUT.store(false, Ordering::SeqCst);
        MASKED.store(1, Ordering::SeqCst);
        handle_alarm_signal(libc::SIGALRM);
        assert!(!TIMED_OUT.load(Ordering::SeqCst));
        MASKED.store(0, Ordering::SeqCst);
    }

    #[test]
    #[cfg(windows)]
    fn watchdog_after_mask_is_a_noop() {
        TIMED_OUT.store(false, Ordering::SeqCst);
        MASKED.store(1, Ordering::SeqCst);
        mark_timed_out_unless_masked();
        assert!(!TIMED_OUT.load(Ordering::SeqCst));
        MASKED.store(0, Ordering::SeqCst);
    }
}
