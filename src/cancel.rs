//! `jobctl cancel` — enqueue a CANCEL request for an existing job.

use anyhow::Result;

use crate::config::Config;
use crate::looper;
use crate::schema::{CancelData, Response};
use crate::store::Store;

pub struct CancelOpts<'a> {
    pub job_id: i64,
    pub submitter: &'a str,
}

pub fn execute(config: &Config, opts: CancelOpts) -> Result<()> {
    let store = Store::open(&config.db_url)?;
    let request_id = looper::cancel_request(&store, opts.job_id, opts.submitter)?;
    Response::new(
        "cancel",
        CancelData {
            request_id,
            job_id: opts.job_id,
        },
    )
    .print();
    Ok(())
}
