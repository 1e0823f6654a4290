// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, bail, Context, Result};
use crossbeam::channel;
use log::{debug, info, warn};
use std::fmt;
use std::fs;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::spawn;
use std::time::{Duration, Instant};
use wait_timeout::ChildExt;

use super::parse::tail_lines;
use super::sweep::Failure;
use iob_util::*;

const POLL_INTV: Duration = Duration::from_millis(100);
// How long to keep reading output after the child is gone. Anything it
// forked may hold on to the pipes.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", &self.program)?;
        for arg in self.args.iter() {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// The external load generator. Only one invocation is ever in flight.
pub trait LoadGen {
    /// Runs `inv` to completion and returns its combined stdout and stderr.
    /// Fails on launch errors, non-zero exit and timeout. Interruption is
    /// reported as `Failure::Interrupted`.
    fn invoke(&mut self, inv: &Invocation) -> Result<String>;

    /// Puts the target device back into a known state before a retry.
    fn reset(&mut self) -> Result<()>;
}

enum WaitOutcome {
    Exited(ExitStatus),
    TimedOut,
    Interrupted,
}

/// Kills the process group led by `child`. Must be called before the child
/// is reaped so that the group id can't be recycled.
fn kill_group(child: &Child) {
    let pgid = child.id() as libc::pid_t;
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } < 0 {
        debug!(
            "run: failed to kill process group {} ({})",
            pgid,
            std::io::Error::last_os_error()
        );
    }
}

/// Waits for `child` for up to `timeout` while watching for program exit.
/// `child` must lead its own process group. Unless it exited on its own, the
/// whole group is killed and `child` reaped.
fn wait_child(child: &mut Child, timeout: Duration) -> Result<WaitOutcome> {
    let started = Instant::now();
    let outcome = loop {
        if prog_exiting() {
            break WaitOutcome::Interrupted;
        }
        if let Some(status) = child.wait_timeout(POLL_INTV)? {
            return Ok(WaitOutcome::Exited(status));
        }
        if started.elapsed() >= timeout {
            break WaitOutcome::TimedOut;
        }
    };

    kill_group(child);
    if let Err(e) = child.kill() {
        debug!("run: failed to kill pid {} ({})", child.id(), &e);
    }
    child.wait()?;
    Ok(outcome)
}

pub struct RunCtx {
    tail: usize,
    reset_cmd: Option<String>,
}

impl RunCtx {
    pub fn new(tail: usize, reset_cmd: Option<&str>) -> Self {
        Self {
            tail,
            reset_cmd: reset_cmd.map(|x| x.to_string()),
        }
    }

    /// Gathers the output lines until both readers hit EOF or `DRAIN_GRACE`
    /// passes. Readers still blocked afterwards are left behind.
    fn collect(rx: channel::Receiver<String>) -> String {
        let deadline = Instant::now() + DRAIN_GRACE;
        let mut output = String::new();
        loop {
            let now = Instant::now();
            if now >= deadline {
                warn!("run: output pipes still open after the child exited, giving up on them");
                break;
            }
            match rx.recv_timeout(deadline - now) {
                Ok(line) => {
                    output += &line;
                    output += "\n";
                }
                Err(channel::RecvTimeoutError::Disconnected) => break,
                Err(channel::RecvTimeoutError::Timeout) => (),
            }
        }
        output
    }
}

impl LoadGen for RunCtx {
    fn invoke(&mut self, inv: &Invocation) -> Result<String> {
        debug!("run: {}", inv);
        let mut child = Command::new(&inv.program)
            .args(&inv.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .with_context(|| format!("Failed to start {:?}", &inv.program))?;

        let (tx, rx) = channel::unbounded::<String>();
        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            spawn(move || child_reader_thread("stdout".into(), stdout, tx));
        }
        if let Some(stderr) = child.stderr.take() {
            let tx = tx.clone();
            spawn(move || child_reader_thread("stderr".into(), stderr, tx));
        }
        drop(tx);

        let outcome = wait_child(&mut child, inv.timeout)?;
        let output = Self::collect(rx);

        match outcome {
            WaitOutcome::Exited(status) if status.success() => Ok(tail_lines(&output, self.tail)),
            WaitOutcome::Exited(status) => {
                debug!("run: output of failed {:?}\n{}", &inv.program, &output);
                bail!("{:?} failed ({})", &inv.program, &status);
            }
            WaitOutcome::TimedOut => bail!(
                "{:?} timed out after {}",
                &inv.program,
                format_duration(inv.timeout.as_secs_f64())
            ),
            WaitOutcome::Interrupted => Err(anyhow!(Failure::Interrupted)),
        }
    }

    fn reset(&mut self) -> Result<()> {
        if let Some(cmd) = self.reset_cmd.as_ref() {
            info!("run: resetting device with {:?}", cmd);
            run_command(
                Command::new("/bin/sh").arg("-c").arg(cmd),
                "device reset failed",
            )?;
        }
        Ok(())
    }
}

/// A background process whose stdout and stderr go to a log file.
pub struct LoggedChild {
    name: String,
    child: Child,
}

impl LoggedChild {
    pub fn spawn<P: AsRef<Path>>(program: &str, args: &[String], log_path: P) -> Result<Self> {
        let log_path = log_path.as_ref();
        let log = fs::File::create(log_path)
            .with_context(|| format!("Failed to create {:?}", log_path))?;
        let log_err = log.try_clone()?;

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            .process_group(0)
            .spawn()
            .with_context(|| format!("Failed to start {:?}", program))?;
        debug!("run: started {:?} (pid {}) logging to {:?}", program, child.id(), log_path);

        Ok(Self {
            name: program.to_string(),
            child,
        })
    }

    /// Waits up to `timeout` for the process to finish on its own and kills
    /// it otherwise. Returns whether it exited by itself.
    pub fn finish(mut self, timeout: Duration) -> Result<bool> {
        match wait_child(&mut self.child, timeout)? {
            WaitOutcome::Exited(status) => {
                if !status.success() {
                    warn!("run: {:?} exited with {}", &self.name, &status);
                }
                Ok(true)
            }
            WaitOutcome::TimedOut => {
                warn!("run: {:?} overstayed, killed", &self.name);
                Ok(false)
            }
            WaitOutcome::Interrupted => Ok(false),
        }
    }
}
