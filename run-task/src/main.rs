//! `run-task` entry point.
//!
//! Parses the command line and environment, runs the task through the
//! orchestrator and exits with the resulting code.

use std::collections::BTreeMap;

use run_task::cli::{DeclarationError, parse_args, parse_repositories, task_request};
use run_task::core::types::Platform;
use run_task::error::RunTaskError;
use run_task::exit_codes;
use run_task::io::checkout::{CheckoutError, VcsClients};
use run_task::io::config::load_config;
use run_task::io::privilege::SystemUserDatabase;
use run_task::io::probe::probe;
use run_task::io::secrets::TaskclusterSecrets;
use run_task::io::supervisor::{SignalHold, SupervisorOptions};
use run_task::orchestrator::{RunContext, run_task};
use run_task::status::StatusLog;
use tracing::warn;

fn main() {
    // Before anything can start a thread.
    let held = SignalHold::acquire();
    run_task::logging::init();
    let signals = match held {
        Ok(hold) => Some(hold),
        Err(err) => {
            warn!(err = %err, "blocking forwarded signals failed");
            None
        }
    };
    let code = run(signals);
    std::process::exit(code);
}

fn run(signals: Option<SignalHold>) -> i32 {
    let status = StatusLog::stdout();
    let env: BTreeMap<String, String> = std::env::vars_os()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
        .collect();

    let repositories = match parse_repositories(env.get("REPOSITORIES").map(String::as_str)) {
        Ok(repositories) => repositories,
        Err(err) => return abort(&status, err.into()),
    };
    let invocation = match parse_args(std::env::args_os(), &repositories) {
        Ok(invocation) => invocation,
        Err(DeclarationError::Usage(err)) => {
            let _ = err.print();
            return if err.use_stderr() {
                exit_codes::CONFIGURATION
            } else {
                exit_codes::OK
            };
        }
        Err(err) => return abort(&status, err.into()),
    };
    let config = match load_config(invocation.cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => return abort(&status, RunTaskError::Config(err)),
    };
    let request = match task_request(&invocation, &env) {
        Ok(request) => request,
        Err(err) => return abort(&status, err.into()),
    };
    let secrets = match TaskclusterSecrets::new(config.secrets_base_url.clone()) {
        Ok(secrets) => secrets,
        Err(err) => return abort(&status, CheckoutError::from(err).into()),
    };
    // Helper threads are up; only the task phase forwards from here on.
    drop(signals);

    let report = probe(Platform::current());
    let clients = VcsClients::from_config(&config);
    let ctx = RunContext {
        report: &report,
        config: &config,
        users: &SystemUserDatabase,
        secrets: &secrets,
        clients: &clients,
        status: &status,
        supervisor: SupervisorOptions::default(),
    };
    run_task(&request, &ctx).outcome.code()
}

fn abort(status: &StatusLog, err: RunTaskError) -> i32 {
    status.emit("setup", &err.diagnostic());
    err.outcome().code()
}
