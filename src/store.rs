//! Durable store (spec's external "database" collaborator, §6).
//!
//! Minimal embedded persistence over `rusqlite`: two tables, `requests` and
//! `jobs`, with the columns named in spec §3. No migration framework — the
//! schema is a single idempotent `CREATE TABLE IF NOT EXISTS` run at open,
//! consistent with the explicit Non-goal excluding "database schema and
//! migration tooling" from the core (spec §1). Each state transition is one
//! commit, per spec §5's transaction-boundary rule.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::StoreError;
use crate::model::{Job, JobState, Request, RequestAction, RequestState, Resources, TimeSlot};

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(url: &str) -> Result<Store, StoreError> {
        let path = url.strip_prefix("sqlite://").unwrap_or(url);
        let conn = if path.is_empty() || path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        let store = Store { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS requests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                action TEXT NOT NULL,
                job_type TEXT,
                parameters TEXT,
                job_id INTEGER,
                priority INTEGER NOT NULL,
                start_date INTEGER,
                time_slot INTEGER NOT NULL,
                timeout INTEGER NOT NULL,
                submitter TEXT NOT NULL,
                submit_date INTEGER NOT NULL,
                state TEXT NOT NULL,
                result TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_type TEXT NOT NULL,
                parameters TEXT NOT NULL,
                resources TEXT NOT NULL,
                description TEXT NOT NULL,
                priority INTEGER NOT NULL,
                submit_date INTEGER NOT NULL,
                start_date INTEGER,
                time_slot INTEGER NOT NULL,
                timeout INTEGER NOT NULL,
                state TEXT NOT NULL,
                pid INTEGER,
                start_date_actual INTEGER,
                end_date INTEGER,
                result TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    // ---- requests ----

    pub fn insert_request(&self, req: &Request) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT INTO requests (action, job_type, parameters, job_id, priority, start_date, time_slot, timeout, submitter, submit_date, state, result)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
            params![
                action_str(req.action),
                req.job_type,
                req.parameters,
                req.job_id,
                req.priority,
                req.start_date,
                req.time_slot.0,
                req.timeout as i64,
                req.submitter,
                req.submit_date,
                request_state_str(req.state),
                req.result,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn update_request(&self, req: &Request) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE requests SET state=?1, result=?2, job_id=?3 WHERE id=?4",
            params![request_state_str(req.state), req.result, req.job_id, req.id],
        )?;
        Ok(())
    }

    pub fn pending_requests_ordered(&self) -> Result<Vec<Request>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, action, job_type, parameters, job_id, priority, start_date, time_slot, timeout, submitter, submit_date, state, result
             FROM requests WHERE state = 'PENDING' ORDER BY submit_date ASC",
        )?;
        let rows = stmt.query_map([], row_to_request)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    pub fn get_request(&self, id: i64) -> Result<Request, StoreError> {
        self.conn
            .query_row(
                "SELECT id, action, job_type, parameters, job_id, priority, start_date, time_slot, timeout, submitter, submit_date, state, result
                 FROM requests WHERE id=?1",
                params![id],
                row_to_request,
            )
            .optional()?
            .ok_or(StoreError::RequestNotFound(id))
    }

    // ---- jobs ----

    pub fn insert_job(&self, job: &Job) -> Result<i64, StoreError> {
        self.conn.execute(
            "INSERT INTO jobs (job_type, parameters, resources, description, priority, submit_date, start_date, time_slot, timeout, state, pid, start_date_actual, end_date, result)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14)",
            params![
                job.job_type,
                job.parameters,
                serde_json::to_string(&job.resources)?,
                job.description,
                job.priority,
                job.submit_date,
                job.start_date,
                job.time_slot.0,
                job.timeout as i64,
                job_state_str(job.state),
                job.pid,
                job.start_date_actual,
                job.end_date,
                job.result,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn update_job(&self, job: &Job) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE jobs SET state=?1, pid=?2, start_date_actual=?3, end_date=?4, result=?5 WHERE id=?6",
            params![
                job_state_str(job.state),
                job.pid,
                job.start_date_actual,
                job.end_date,
                job.result,
                job.id,
            ],
        )?;
        Ok(())
    }

    pub fn get_job(&self, id: i64) -> Result<Job, StoreError> {
        self.conn
            .query_row(
                "SELECT id, job_type, parameters, resources, description, priority, submit_date, start_date, time_slot, timeout, state, pid, start_date_actual, end_date, result
                 FROM jobs WHERE id=?1",
                params![id],
                row_to_job,
            )
            .optional()?
            .ok_or(StoreError::JobNotFound(id))
    }

    /// Most recent jobs, newest first, for the `jobctl list` command.
    pub fn list_jobs(&self, limit: u32) -> Result<Vec<Job>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, job_type, parameters, resources, description, priority, submit_date, start_date, time_slot, timeout, state, pid, start_date_actual, end_date, result
             FROM jobs ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], row_to_job)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    /// `SELECT * FROM jobs WHERE state IN (WAITING, RUNNING, CLEANINGUP)`,
    /// used by startup recovery (spec §4.5) to rebuild the in-memory queues.
    pub fn nonterminal_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, job_type, parameters, resources, description, priority, submit_date, start_date, time_slot, timeout, state, pid, start_date_actual, end_date, result
             FROM jobs WHERE state IN ('WAITING','RUNNING','CLEANINGUP')",
        )?;
        let rows = stmt.query_map([], row_to_job)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }
}

fn action_str(a: RequestAction) -> &'static str {
    match a {
        RequestAction::Submit => "SUBMIT",
        RequestAction::Cancel => "CANCEL",
    }
}

fn action_from_str(s: &str) -> RequestAction {
    match s {
        "CANCEL" => RequestAction::Cancel,
        _ => RequestAction::Submit,
    }
}

fn request_state_str(s: RequestState) -> &'static str {
    match s {
        RequestState::Pending => "PENDING",
        RequestState::Completed => "COMPLETED",
        RequestState::Failed => "FAILED",
    }
}

fn request_state_from_str(s: &str) -> RequestState {
    match s {
        "COMPLETED" => RequestState::Completed,
        "FAILED" => RequestState::Failed,
        _ => RequestState::Pending,
    }
}

fn job_state_str(s: JobState) -> &'static str {
    s.as_str()
}

fn job_state_from_str(s: &str) -> JobState {
    match s {
        "RUNNING" => JobState::Running,
        "CLEANINGUP" => JobState::CleaningUp,
        "COMPLETED" => JobState::Completed,
        "CANCELED" => JobState::Canceled,
        "FAILED" => JobState::Failed,
        _ => JobState::Waiting,
    }
}

fn row_to_request(row: &Row) -> rusqlite::Result<Request> {
    Ok(Request {
        id: row.get(0)?,
        action: action_from_str(&row.get::<_, String>(1)?),
        job_type: row.get(2)?,
        parameters: row.get(3)?,
        job_id: row.get(4)?,
        priority: row.get(5)?,
        start_date: row.get(6)?,
        time_slot: TimeSlot(row.get(7)?),
        timeout: row.get::<_, i64>(8)? as u64,
        submitter: row.get(9)?,
        submit_date: row.get(10)?,
        state: request_state_from_str(&row.get::<_, String>(11)?),
        result: row.get(12)?,
    })
}

fn row_to_job(row: &Row) -> rusqlite::Result<Job> {
    let resources_json: String = row.get(3)?;
    let resources: Resources = serde_json::from_str(&resources_json).unwrap_or_default();
    Ok(Job {
        id: row.get(0)?,
        job_type: row.get(1)?,
        parameters: row.get(2)?,
        resources,
        description: row.get(4)?,
        priority: row.get(5)?,
        submit_date: row.get(6)?,
        start_date: row.get(7)?,
        time_slot: TimeSlot(row.get(8)?),
        timeout: row.get::<_, i64>(9)? as u64,
        state: job_state_from_str(&row.get::<_, String>(10)?),
        pid: row.get(11)?,
        start_date_actual: row.get(12)?,
        end_date: row.get(13)?,
        result: row.get(14)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job(store: &Store) -> Job {
        let job = Job {
            id: 0,
            job_type: "echo".into(),
            parameters: "{}".into(),
            resources: Resources::default(),
            description: "d".into(),
            priority: 0,
            submit_date: 0,
            start_date: None,
            time_slot: TimeSlot::DEFAULT,
            timeout: 0,
            state: JobState::Waiting,
            pid: None,
            start_date_actual: None,
            end_date: None,
            result: "Waiting for resources".into(),
        };
        let id = store.insert_job(&job).unwrap();
        Job { id, ..job }
    }

    #[test]
    fn insert_and_get_job_round_trips() {
        let store = Store::open(":memory:").unwrap();
        let job = sample_job(&store);
        let fetched = store.get_job(job.id).unwrap();
        assert_eq!(fetched.job_type, "echo");
        assert_eq!(fetched.state, JobState::Waiting);
    }

    #[test]
    fn update_job_persists_state_transition() {
        let store = Store::open(":memory:").unwrap();
        let mut job = sample_job(&store);
        job.state = JobState::Running;
        job.pid = Some(1234);
        store.update_job(&job).unwrap();
        let fetched = store.get_job(job.id).unwrap();
        assert_eq!(fetched.state, JobState::Running);
        assert_eq!(fetched.pid, Some(1234));
    }

    #[test]
    fn nonterminal_jobs_excludes_terminal_states() {
        let store = Store::open(":memory:").unwrap();
        let mut waiting = sample_job(&store);
        let mut done = sample_job(&store);
        done.state = JobState::Completed;
        store.update_job(&done).unwrap();
        waiting.state = JobState::Waiting;
        store.update_job(&waiting).unwrap();

        let recoverable = store.nonterminal_jobs().unwrap();
        assert_eq!(recoverable.len(), 1);
        assert_eq!(recoverable[0].id, waiting.id);
    }

    #[test]
    fn pending_requests_ordered_by_submit_date() {
        let store = Store::open(":memory:").unwrap();
        let later = Request {
            id: 0,
            action: RequestAction::Submit,
            job_type: Some("echo".into()),
            parameters: Some("{}".into()),
            job_id: None,
            priority: 0,
            start_date: None,
            time_slot: TimeSlot::DEFAULT,
            timeout: 0,
            submitter: "alice".into(),
            submit_date: 100,
            state: RequestState::Pending,
            result: String::new(),
        };
        let earlier = Request {
            submit_date: 10,
            ..later.clone()
        };
        store.insert_request(&later).unwrap();
        store.insert_request(&earlier).unwrap();

        let pending = store.pending_requests_ordered().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].submit_date, 10);
        assert_eq!(pending[1].submit_date, 100);
    }
}
