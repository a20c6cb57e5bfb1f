//! `jobctl status` — look up a single job's current record.

use anyhow::Result;

use crate::config::Config;
use crate::schema::{Response, StatusData};
use crate::store::Store;

pub struct StatusOpts {
    pub job_id: i64,
}

pub fn execute(config: &Config, opts: StatusOpts) -> Result<()> {
    let store = Store::open(&config.db_url)?;
    let job = store.get_job(opts.job_id)?;
    Response::new(
        "status",
        StatusData {
            job_id: job.id,
            job_type: job.job_type,
            state: job.state.as_str().to_string(),
            description: job.description,
            result: job.result,
            pid: job.pid,
            start_date_actual: job.start_date_actual,
            end_date: job.end_date,
        },
    )
    .print();
    Ok(())
}
