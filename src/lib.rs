//! jobctl v0.1 — core library
//!
//! A single-process mainframe-job scheduler: a streaming JSON decoder, a
//! worker-side process wrapper, a fork/exec spawner, a resource manager, and
//! the scheduler loop that ties them together over a durable SQLite store.

pub mod cancel;
pub mod config;
pub mod error;
pub mod jobstore;
pub mod json_stream;
pub mod list;
pub mod looper;
pub mod machine;
pub mod model;
pub mod permissions;
pub mod resources;
pub mod schema;
pub mod spawner;
pub mod status;
pub mod store;
pub mod submit;
pub mod timefmt;
pub mod wrapper;
