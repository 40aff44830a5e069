//! Chains external programs stdout-to-stdin without a shell.
//!
//! Each stage is a plain `Command`. Stage stderr is collected on its own
//! thread so a chatty tool cannot stall the chain. The last stage's stdout is
//! copied into a caller supplied writer. Optionally the bytes flowing out of
//! the first stage are pumped through a hasher on their way to the second.

use std::fs::File;
use std::io::{self, Read, Write};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Error, Result};
use crate::log_sanitize::{command_line, sanitize_log_line, summarize_output};

const MAX_STDERR_BYTES: usize = 64 * 1024;

pub struct Stage {
    name: &'static str,
    cmd: Command,
}

impl Stage {
    pub fn new(name: &'static str, cmd: Command) -> Self {
        Self { name, cmd }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn command(&self) -> &Command {
        &self.cmd
    }
}

#[derive(Debug, Default)]
pub struct PipelineOutput {
    /// SHA-256 of the first stage's output, when tapped.
    pub tap_fingerprint: Option<String>,
}

struct Running {
    name: &'static str,
    child: Child,
    stderr: Option<JoinHandle<Vec<u8>>>,
}

fn collect_stderr<R: Read + Send + 'static>(reader: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut kept = Vec::new();
        let mut buf = [0u8; 8192];
        let mut r = reader;
        loop {
            let n = match r.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let room = MAX_STDERR_BYTES.saturating_sub(kept.len());
            kept.extend_from_slice(&buf[..n.min(room)]);
        }
        kept
    })
}

fn pump_hashed(mut from: ChildStdout, mut to: impl Write) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = from.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        to.write_all(&buf[..n])?;
    }
    to.flush()?;
    Ok(hex::encode(hasher.finalize()))
}

fn kill_all(running: &mut [Running]) {
    for r in running.iter_mut() {
        let _ = r.child.kill();
    }
}

/// Runs `stages` as one chain. `input` feeds the first stage (null when
/// absent); the final stage's stdout is copied into `output`.
///
/// When `tap_first` is set the first stage's output is fingerprinted. With a
/// single stage that is the same stream the caller receives, so the tap is
/// left to the caller.
pub fn run<W: Write>(
    stages: Vec<Stage>,
    input: Option<File>,
    output: &mut W,
    tap_first: bool,
) -> Result<PipelineOutput> {
    if stages.is_empty() {
        return Err(Error::msg("empty pipeline"));
    }
    let last = stages.len() - 1;
    let mut running: Vec<Running> = Vec::with_capacity(stages.len());
    let mut prev_stdout: Option<ChildStdout> = None;
    let mut pump_pending = false;
    let mut tap: Option<JoinHandle<io::Result<String>>> = None;
    let mut input = input;

    for (idx, stage) in stages.into_iter().enumerate() {
        let Stage { name, mut cmd } = stage;
        let stdin = if idx == 0 {
            input.take().map(Stdio::from).unwrap_or_else(Stdio::null)
        } else if pump_pending {
            Stdio::piped()
        } else {
            prev_stdout.take().map(Stdio::from).unwrap_or_else(Stdio::null)
        };
        debug!(stage = name, command = %command_line(&cmd), "spawning pipeline stage");
        let spawned = cmd
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let mut child = match spawned {
            Ok(c) => c,
            Err(e) => {
                kill_all(&mut running);
                wait_quiet(&mut running);
                return Err(Error::msg(format!("failed to start {name}: {e}")));
            }
        };

        if pump_pending {
            pump_pending = false;
            let from = running.last_mut().and_then(|r| r.child.stdout.take());
            if let (Some(from), Some(to)) = (from, child.stdin.take()) {
                tap = Some(thread::spawn(move || pump_hashed(from, to)));
            }
        }

        let stderr = child.stderr.take().map(collect_stderr);
        if idx < last {
            if tap_first && idx == 0 {
                // Stdout stays on the child until the next stage can take the pump.
                pump_pending = true;
            } else {
                prev_stdout = child.stdout.take();
            }
        }
        running.push(Running {
            name,
            child,
            stderr,
        });
    }

    let copied = match running.last_mut().and_then(|r| r.child.stdout.take()) {
        Some(mut out) => io::copy(&mut out, output).and_then(|_| output.flush()),
        None => Err(io::Error::other("final stage has no stdout")),
    };
    if copied.is_err() {
        kill_all(&mut running);
    }

    let tap_result = tap.map(|h| {
        h.join()
            .unwrap_or_else(|_| Err(io::Error::other("tap thread panicked")))
    });

    let mut failure: Option<String> = None;
    for r in running.iter_mut() {
        let status = r.child.wait();
        let stderr = r
            .stderr
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        log_stderr(r.name, &stderr);
        if failure.is_some() {
            continue;
        }
        match status {
            Ok(s) if s.success() => {}
            Ok(s) => failure = Some(stage_failure(r.name, s, &stderr)),
            Err(e) => failure = Some(format!("{} wait failed: {e}", r.name)),
        }
    }

    if let Some(msg) = failure {
        return Err(Error::msg(msg));
    }
    if let Err(e) = copied {
        return Err(Error::msg(format!("failed to write pipeline output: {e}")));
    }
    let tap_fingerprint = match tap_result {
        Some(Ok(fp)) => Some(fp),
        Some(Err(e)) => return Err(Error::msg(format!("pipeline tap failed: {e}"))),
        None => None,
    };
    Ok(PipelineOutput { tap_fingerprint })
}

fn wait_quiet(running: &mut [Running]) {
    for r in running.iter_mut() {
        let _ = r.child.wait();
    }
}

fn stage_failure(name: &str, status: ExitStatus, stderr: &[u8]) -> String {
    let detail = summarize_output(stderr);
    if detail.is_empty() {
        format!("{name} failed: {status}")
    } else {
        format!("{name} failed: {status}: {detail}")
    }
}

fn log_stderr(stage: &str, raw: &[u8]) {
    for line in String::from_utf8_lossy(raw).lines() {
        let line = sanitize_log_line(line);
        if !line.trim().is_empty() {
            debug!(stage, line = %line, "stage output");
        }
    }
}
