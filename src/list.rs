//! `jobctl list` — the most recent jobs, newest first.

use anyhow::Result;

use crate::config::Config;
use crate::schema::{JobSummary, ListData, Response};
use crate::store::Store;

pub struct ListOpts {
    pub limit: u32,
}

pub fn execute(config: &Config, opts: ListOpts) -> Result<()> {
    let store = Store::open(&config.db_url)?;
    // Fetch one extra row to detect whether the result was truncated.
    let mut jobs = store.list_jobs(opts.limit + 1)?;
    let truncated = jobs.len() > opts.limit as usize;
    jobs.truncate(opts.limit as usize);

    let summaries = jobs
        .into_iter()
        .map(|job| JobSummary {
            job_id: job.id,
            job_type: job.job_type,
            state: job.state.as_str().to_string(),
            priority: job.priority,
            submit_date: job.submit_date,
            start_date_actual: job.start_date_actual,
        })
        .collect();

    Response::new("list", ListData { jobs: summaries, truncated }).print();
    Ok(())
}
