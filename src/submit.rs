//! `jobctl submit` — enqueue a SUBMIT request and print its request id.
//!
//! Submitting only enqueues a request; the running scheduler daemon (or the
//! next `jobctl run` tick) is responsible for admitting it into a job.

use anyhow::Result;

use crate::config::Config;
use crate::looper;
use crate::schema::{Response, SubmitData};
use crate::store::Store;

pub struct SubmitOpts<'a> {
    pub job_type: &'a str,
    pub parameters: &'a str,
    pub priority: i32,
    pub start_date: Option<i64>,
    pub timeout: u64,
    pub submitter: &'a str,
}

pub fn execute(config: &Config, opts: SubmitOpts) -> Result<()> {
    let store = Store::open(&config.db_url)?;
    let request_id = looper::submit_request(
        &store,
        opts.job_type,
        opts.parameters,
        opts.priority,
        opts.start_date,
        opts.timeout,
        opts.submitter,
    )?;
    Response::new("submit", SubmitData { request_id }).print();
    Ok(())
}
