//! CI task wrapper.
//!
//! `run-task` prepares the environment of a CI task and then runs the task
//! command: it drops root privileges, verifies persistent caches and empty
//! volumes, checks out the declared repositories and finally supervises the
//! task, reporting every failure as one exit code from [`exit_codes`].
//!
//! - **[`core`]**: Pure, deterministic logic (privilege decision, cache
//!   markers, failure classification, run states). No I/O.
//! - **[`io`]**: Side-effecting stages (filesystem, VCS clients, secrets,
//!   process supervision). Isolated behind traits where tests need fakes.
//!
//! [`orchestrator`] sequences the stages; [`cli`] turns the command line and
//! environment into a [`orchestrator::TaskRequest`].

pub mod cli;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod messages;
pub mod orchestrator;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
