//! Child process supervision: launch, relay output, forward signals, reap.

use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};

use tracing::{debug, instrument, warn};

use crate::status::StatusLog;

#[derive(Debug, Clone, Copy)]
pub struct SupervisorOptions {
    /// Forward SIGTERM, SIGINT, SIGHUP and SIGQUIT to the child while it runs.
    pub forward_signals: bool,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            forward_signals: true,
        }
    }
}

/// Run `cmd` to completion, relaying each output line through `status`
/// under `phase`. Returns the exit code, `128 + N` for death by signal N.
///
/// Fails only when the child cannot be spawned or reaped.
#[instrument(skip_all, fields(phase = %phase))]
pub fn supervise(
    mut cmd: Command,
    status: &StatusLog,
    phase: &str,
    options: SupervisorOptions,
) -> std::io::Result<i32> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = cmd.spawn()?;
    debug!(pid = child.id(), "child started");

    // Installed before the relay threads so they inherit the blocked mask.
    let forwarder = if options.forward_signals {
        match forwarding::SignalForwarder::start(child.id()) {
            Ok(forwarder) => Some(forwarder),
            Err(err) => {
                warn!(err = %err, "signal forwarding unavailable");
                None
            }
        }
    } else {
        None
    };

    let relays = match start_relays(&mut child, status, phase) {
        Ok(relays) => relays,
        Err(err) => {
            warn!(err = %err, "starting output relay failed; killing child");
            abandon(&mut child);
            if let Some(forwarder) = forwarder {
                forwarder.stop();
            }
            return Err(err);
        }
    };

    let waited = child.wait();
    for handle in relays {
        if handle.join().is_err() {
            warn!("output relay thread panicked");
        }
    }
    if let Some(forwarder) = forwarder {
        forwarder.stop();
    }

    let exit = waited?;
    let code = exit_code(exit);
    debug!(code, "child exited");
    Ok(code)
}

/// Kill and reap a child nobody will supervise.
fn abandon(child: &mut Child) {
    if let Err(err) = child.kill() {
        debug!(err = %err, "kill failed; child may have exited");
    }
    if let Err(err) = child.wait() {
        warn!(err = %err, "reaping abandoned child failed");
    }
}

fn start_relays(
    child: &mut Child,
    status: &StatusLog,
    phase: &str,
) -> std::io::Result<Vec<JoinHandle<()>>> {
    let mut relays = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        relays.push(relay(stdout, status.clone(), phase.to_string())?);
    }
    if let Some(stderr) = child.stderr.take() {
        relays.push(relay(stderr, status.clone(), phase.to_string())?);
    }
    Ok(relays)
}

fn relay<R: Read + Send + 'static>(
    source: R,
    status: StatusLog,
    phase: String,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("relay-{phase}"))
        .spawn(move || {
            let mut reader = BufReader::new(source);
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line) {
                    Ok(0) => break,
                    Ok(_) => {
                        let text = String::from_utf8_lossy(&line);
                        status.emit(&phase, text.trim_end_matches(['\n', '\r']));
                    }
                    Err(err) => {
                        warn!(err = %err, "reading child output failed");
                        break;
                    }
                }
            }
        })
}

/// Exit code to propagate for a finished child.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

/// Keeps the forwarded signals blocked on the calling thread until dropped.
///
/// Taken at the top of `main`, before any thread exists, so helper threads
/// started meanwhile (the HTTP client runtime among them) inherit the block
/// and never receive a signal meant for the task.
#[must_use = "the signals are unblocked again when the hold is dropped"]
pub struct SignalHold {
    previous: Option<forwarding::Mask>,
}

impl SignalHold {
    pub fn acquire() -> std::io::Result<Self> {
        Ok(Self {
            previous: Some(forwarding::block()?),
        })
    }
}

impl Drop for SignalHold {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            forwarding::restore(&previous);
        }
    }
}

#[cfg(unix)]
mod forwarding {
    use std::os::unix::thread::JoinHandleExt;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread::{self, JoinHandle};

    use nix::sys::pthread::{Pthread, pthread_kill};
    use nix::sys::signal::{SigSet, SigmaskHow, Signal, kill};
    use nix::unistd::Pid;
    use tracing::{debug, warn};

    const FORWARDED: [Signal; 4] = [
        Signal::SIGTERM,
        Signal::SIGINT,
        Signal::SIGHUP,
        Signal::SIGQUIT,
    ];

    pub(super) type Mask = SigSet;

    fn forwarded() -> SigSet {
        let mut mask = SigSet::empty();
        for signal in FORWARDED {
            mask.add(signal);
        }
        mask
    }

    /// Block the forwarded set on this thread; returns the previous mask.
    pub(super) fn block() -> std::io::Result<SigSet> {
        forwarded()
            .thread_swap_mask(SigmaskHow::SIG_BLOCK)
            .map_err(std::io::Error::from)
    }

    pub(super) fn restore(previous: &SigSet) {
        if let Err(err) = previous.thread_set_mask() {
            warn!(err = %err, "restoring signal mask failed");
        }
    }

    /// Thread that `sigwait`s on the forwarded set and relays to the child.
    pub(super) struct SignalForwarder {
        handle: JoinHandle<()>,
        finished: Arc<AtomicBool>,
        previous: SigSet,
    }

    impl SignalForwarder {
        pub(super) fn start(child: u32) -> std::io::Result<Self> {
            let pid = i32::try_from(child)
                .map(Pid::from_raw)
                .map_err(|err| std::io::Error::other(err.to_string()))?;
            let previous = block()?;

            let mask = forwarded();
            let finished = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&finished);
            let spawned = thread::Builder::new()
                .name("signal-forwarder".to_string())
                .spawn(move || {
                    loop {
                        let signal = match mask.wait() {
                            Ok(signal) => signal,
                            Err(err) => {
                                warn!(err = %err, "sigwait failed");
                                break;
                            }
                        };
                        if flag.load(Ordering::SeqCst) {
                            break;
                        }
                        debug!(?signal, %pid, "forwarding signal to child");
                        if let Err(err) = kill(pid, signal) {
                            warn!(err = %err, ?signal, "forwarding signal failed");
                        }
                    }
                });
            match spawned {
                Ok(handle) => Ok(Self {
                    handle,
                    finished,
                    previous,
                }),
                Err(err) => {
                    restore(&previous);
                    Err(err)
                }
            }
        }

        /// Wake the forwarder, wait for it and restore the signal mask.
        pub(super) fn stop(self) {
            self.finished.store(true, Ordering::SeqCst);
            let thread = self.handle.as_pthread_t() as Pthread;
            if let Err(err) = pthread_kill(thread, Signal::SIGTERM) {
                warn!(err = %err, "waking signal forwarder failed");
            }
            if self.handle.join().is_err() {
                warn!("signal forwarder panicked");
            }
            restore(&self.previous);
        }
    }
}

#[cfg(not(unix))]
mod forwarding {
    pub(super) type Mask = ();

    pub(super) fn block() -> std::io::Result<Mask> {
        Ok(())
    }

    pub(super) fn restore(_previous: &Mask) {}

    pub(super) struct SignalForwarder;

    impl SignalForwarder {
        pub(super) fn start(_child: u32) -> std::io::Result<Self> {
            Err(std::io::Error::other("signal forwarding needs a unix host"))
        }

        pub(super) fn stop(self) {}
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::SharedBuffer;

    fn quiet() -> SupervisorOptions {
        SupervisorOptions {
            forward_signals: false,
        }
    }

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        cmd
    }

    #[test]
    fn propagates_exit_code() {
        let status = StatusLog::new(SharedBuffer::default());
        assert_eq!(supervise(sh("exit 0"), &status, "task", quiet()).expect("run"), 0);
        assert_eq!(supervise(sh("exit 3"), &status, "task", quiet()).expect("run"), 3);
    }

    #[test]
    fn death_by_signal_maps_to_128_plus_n() {
        let status = StatusLog::new(SharedBuffer::default());
        let code = supervise(sh("kill -TERM $$"), &status, "task", quiet()).expect("run");
        assert_eq!(code, 128 + 15);
    }

    #[test]
    fn relays_both_streams_with_phase_prefix() {
        let buffer = SharedBuffer::default();
        let status = StatusLog::new(buffer.clone());
        supervise(sh("echo out; echo err >&2"), &status, "task", quiet()).expect("run");
        let text = buffer.contents();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines.iter().all(|line| line.starts_with("[task ")));
        assert!(lines.iter().any(|line| line.ends_with("] out")));
        assert!(lines.iter().any(|line| line.ends_with("] err")));
    }

    #[test]
    fn forwarding_does_not_disturb_normal_exit() {
        let status = StatusLog::new(SharedBuffer::default());
        let code = supervise(sh("exit 7"), &status, "task", SupervisorOptions::default())
            .expect("run");
        assert_eq!(code, 7);
    }

    #[test]
    fn abandoned_child_is_killed_and_reaped() {
        let mut child = sh("sleep 30").spawn().expect("spawn");
        abandon(&mut child);
        let status = child.try_wait().expect("try_wait").expect("already reaped");
        assert_eq!(exit_code(status), 128 + 9);
    }

    #[test]
    fn missing_program_fails_to_spawn() {
        let status = StatusLog::new(SharedBuffer::default());
        let err = supervise(
            Command::new("/nonexistent/run-task-test-binary"),
            &status,
            "task",
            quiet(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
