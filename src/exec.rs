//! Test executor
//!
//! `run_captured` is the single narrow boundary between the engine and the
//! OS: it takes a fully expanded argv and returns exit status plus merged
//! stdout/stderr bytes, racing the child against a timeout. Everything that
//! launches a process — the test command, `$(...)` substitutions, and
//! `success-command` checks — goes through it.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use similar::TextDiff;

use crate::config::Criterion;
use crate::env::EnvMap;
use crate::expand::{expand, ExpandContext};
use crate::resolver::{CommandForm, ResolvedTest};

/// Raw result of one process run.
pub struct Captured {
    pub status: Option<ExitStatus>,
    pub timed_out: bool,
    /// Merged stdout + stderr, interleaved as the child wrote them
    pub output: Vec<u8>,
}

impl Captured {
    pub fn exit_code(&self) -> Option<i32> {
        self.status.and_then(|s| s.code())
    }

    pub fn signal(&self) -> Option<i32> {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            self.status.and_then(|s| s.signal())
        }
        #[cfg(not(unix))]
        {
            None
        }
    }
}

/// Spawn a process with the given environment and working directory,
/// capture its combined output, and kill it if it outlives `timeout`.
///
/// The child's stdout and stderr share one pipe so interleaving matches
/// what a terminal would show. The pipe is drained on a reader thread and
/// every wait on it is bounded by the deadline: a grandchild that inherited
/// the write end (`sleep 600 &`) costs at most the remaining timeout, and
/// whatever bytes were collected by then are returned.
pub fn run_captured(
    program: &str,
    args: &[String],
    env: &EnvMap,
    chdir: Option<&Path>,
    timeout: Duration,
) -> std::io::Result<Captured> {
    let (mut reader, writer) = std::io::pipe()?;

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(writer.try_clone()?)
        .stderr(writer);
    if let Some(dir) = chdir {
        command.current_dir(dir);
    }
    command.env_clear();
    for (k, v) in env.environ() {
        command.env(k, v);
    }

    let mut child = command.spawn()?;
    // Close the parent's copies of the write end so the reader sees EOF
    // once nothing downstream holds the pipe open.
    drop(command);

    let sink = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = mpsc::channel();
    {
        let sink = Arc::clone(&sink);
        std::thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                match reader.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => match sink.lock() {
                        Ok(mut buf) => buf.extend_from_slice(&chunk[..n]),
                        Err(_) => break,
                    },
                }
            }
            let _ = done_tx.send(());
        });
    }

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            // Wait for EOF, but never past the deadline: a backgrounded
            // grandchild may keep the write end open long after the child
            // exited, and the reader is abandoned rather than joined.
            let remaining = deadline.saturating_duration_since(Instant::now());
            let _ = done_rx.recv_timeout(remaining);
            return Ok(Captured {
                status: Some(status),
                timed_out: false,
                output: take_collected(&sink),
            });
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let status = child.wait().ok();
            let _ = done_rx.recv_timeout(Duration::from_millis(50));
            return Ok(Captured {
                status,
                timed_out: true,
                output: take_collected(&sink),
            });
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

fn take_collected(sink: &Arc<Mutex<Vec<u8>>>) -> Vec<u8> {
    match sink.lock() {
        Ok(mut buf) => std::mem::take(&mut *buf),
        Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
    }
}

/// Outcome of attempting one test.
pub struct Execution {
    pub verdict: Verdict,
    /// The fully expanded command line, quoted for display — present once
    /// expansion succeeded, whether or not the spawn did
    pub command_line: Option<String>,
    /// Expanded `output-matches` value, for the save-output collaborator
    pub expected_output: Option<String>,
    /// Whether the main command actually ran (stdout-to-env applies only then)
    pub executed: bool,
}

/// Pass/fail outcome and evidence for a single executed test.
#[derive(Debug)]
pub struct Verdict {
    pub passed: bool,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub timed_out: bool,
    pub captured_output: Vec<u8>,
    pub failure_reasons: Vec<String>,
}

impl Verdict {
    pub(crate) fn failed_before_spawn(reason: String) -> Self {
        Self {
            passed: false,
            exit_code: None,
            signal: None,
            timed_out: false,
            captured_output: Vec::new(),
            failure_reasons: vec![reason],
        }
    }

    pub fn output_lossy(&self) -> String {
        String::from_utf8_lossy(&self.captured_output).into_owned()
    }
}

/// Execute one resolved test against its effective environment.
pub fn execute(test: &ResolvedTest, env: &EnvMap) -> Execution {
    let settings = &test.settings;
    let timeout = settings.timeout;

    // chdir is itself expansion-eligible; it is resolved first, without a
    // working-directory override of its own.
    let bare = ExpandContext { env, chdir: None, timeout };
    let chdir: Option<PathBuf> = match settings.chdir {
        Some(ref raw) => match expand(raw, &bare) {
            Ok(dir) => Some(PathBuf::from(dir)),
            Err(e) => return failed_expansion("chdir", e),
        },
        None => None,
    };

    let ctx = ExpandContext {
        env,
        chdir: chdir.as_deref(),
        timeout,
    };

    let (program, args) = match test.command() {
        CommandForm::System(template) => {
            let script = match expand(template, &ctx) {
                Ok(s) => s,
                Err(e) => return failed_expansion("system", e),
            };
            let shell = env.get("SHELL").unwrap_or("/bin/sh").to_string();
            (shell, vec!["-c".to_string(), script])
        }
        CommandForm::Exec { path, args } => {
            let program = match expand(path, &ctx) {
                Ok(p) => p,
                Err(e) => return failed_expansion("exec", e),
            };
            let mut expanded = Vec::with_capacity(args.len());
            for arg in args {
                match expand(arg, &ctx) {
                    Ok(a) => expanded.push(a),
                    Err(e) => return failed_expansion("arguments", e),
                }
            }
            (program, expanded)
        }
    };

    let command_line = display_command(&program, &args);

    // Criteria strings are expanded up front so a bad substitution fails the
    // test before its command is spawned.
    let mut criteria = Vec::new();
    for criterion in test.spec.criteria() {
        match expand_criterion(criterion, &ctx) {
            Ok(c) => criteria.push(c),
            Err(e) => {
                let mut exec = failed_expansion("success criteria", e);
                exec.command_line = Some(command_line);
                return exec;
            }
        }
    }
    let expected_output = criteria.iter().find_map(|c| match c {
        Criterion::OutputMatches(s) => Some(s.clone()),
        _ => None,
    });

    let run = match run_captured(&program, &args, env, ctx.chdir, timeout) {
        Ok(run) => run,
        Err(e) => {
            return Execution {
                verdict: Verdict::failed_before_spawn(format!(
                    "failed to execute '{}': {}",
                    program, e
                )),
                command_line: Some(command_line),
                expected_output,
                executed: false,
            }
        }
    };

    let verdict = judge(&run, test, &criteria, &ctx);
    Execution {
        verdict,
        command_line: Some(command_line),
        expected_output,
        executed: true,
    }
}

fn failed_expansion(field: &str, e: crate::expand::ExpandError) -> Execution {
    Execution {
        verdict: Verdict::failed_before_spawn(format!("{}: {}", field, e)),
        command_line: None,
        expected_output: None,
        executed: false,
    }
}

/// Compute the verdict for a finished run. Steps are all evaluated and
/// every applicable reason collected; only `success-command` is gated on
/// the verdict being clean so far, since it spawns a process.
fn judge(
    run: &Captured,
    test: &ResolvedTest,
    criteria: &[Criterion],
    ctx: &ExpandContext<'_>,
) -> Verdict {
    let mut reasons = Vec::new();

    let signal = if run.timed_out {
        // The SIGKILL delivered by the timeout path is not a signal death.
        reasons.push("timeout".to_string());
        None
    } else if let Some(sig) = run.signal() {
        let name = signal_name(sig);
        reasons.push(format!("terminated by signal {}", name));
        Some(name)
    } else {
        None
    };

    let exit_code = run.exit_code();
    if !run.timed_out && signal.is_none() {
        let expected = test.settings.expected_exit_code;
        if exit_code != Some(expected) {
            reasons.push(format!(
                "exit code {}, expected {}",
                exit_code.map_or_else(|| "unknown".to_string(), |c| c.to_string()),
                expected,
            ));
        }
    }

    let output = String::from_utf8_lossy(&run.output);
    for criterion in criteria {
        match criterion {
            Criterion::OutputContains { needles, negate: false } => {
                for needle in needles {
                    if !output.contains(needle.as_str()) {
                        reasons.push(format!("output does not contain {:?}", needle));
                    }
                }
            }
            Criterion::OutputContains { needles, negate: true } => {
                for needle in needles {
                    if output.contains(needle.as_str()) {
                        reasons.push(format!("output contains forbidden {:?}", needle));
                    }
                }
            }
            Criterion::OutputMatches(expected) => {
                // Byte-exact, trailing newline included; compared on the raw
                // bytes so invalid UTF-8 never equals a replacement character
                if run.output != expected.as_bytes() {
                    reasons.push(format!(
                        "output does not match:\n{}",
                        unified_diff(expected, output.as_ref()),
                    ));
                }
            }
            Criterion::SuccessCommand(_) => {}
        }
    }

    if reasons.is_empty() {
        for criterion in criteria {
            if let Criterion::SuccessCommand(cmd) = criterion {
                if let Some(reason) = run_success_command(cmd, ctx) {
                    reasons.push(reason);
                }
            }
        }
    }

    Verdict {
        passed: reasons.is_empty(),
        exit_code,
        signal,
        timed_out: run.timed_out,
        captured_output: run.output.clone(),
        failure_reasons: reasons,
    }
}

/// Run an auxiliary success-check command. Returns a failure reason, or
/// None when the check passed.
fn run_success_command(command: &str, ctx: &ExpandContext<'_>) -> Option<String> {
    let shell = ctx.env.get("SHELL").unwrap_or("/bin/sh").to_string();
    let args = ["-c".to_string(), command.to_string()];
    let run = match run_captured(&shell, &args, ctx.env, ctx.chdir, ctx.timeout) {
        Ok(run) => run,
        Err(e) => return Some(format!("success command failed to start: {}", e)),
    };
    if run.timed_out {
        return Some("success command timed out".to_string());
    }
    match run.exit_code() {
        Some(0) => None,
        code => {
            let output = String::from_utf8_lossy(&run.output);
            let first_line = output.lines().next().unwrap_or("").trim();
            if first_line.is_empty() {
                Some(format!(
                    "success command exited with {}",
                    code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
                ))
            } else {
                Some(format!("success command failed: {}", first_line))
            }
        }
    }
}

fn expand_criterion(
    criterion: Criterion,
    ctx: &ExpandContext<'_>,
) -> Result<Criterion, crate::expand::ExpandError> {
    Ok(match criterion {
        Criterion::OutputContains { needles, negate } => {
            let mut expanded = Vec::with_capacity(needles.len());
            for needle in needles {
                expanded.push(expand(&needle, ctx)?);
            }
            Criterion::OutputContains { needles: expanded, negate }
        }
        Criterion::OutputMatches(s) => Criterion::OutputMatches(expand(&s, ctx)?),
        Criterion::SuccessCommand(s) => Criterion::SuccessCommand(expand(&s, ctx)?),
    })
}

fn unified_diff(expected: &str, actual: &str) -> String {
    let diff = TextDiff::from_lines(expected, actual);
    diff.unified_diff().header("expected", "actual").to_string()
}

/// Quote-and-join an argv for display and for the save-output `command` file.
pub fn display_command(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .map(quote_arg)
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote_arg(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains(|c: char| c.is_whitespace() || "'\"\\$`".contains(c)) {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Symbolic name for a Unix signal number.
pub fn signal_name(signal: i32) -> String {
    match signal {
        1 => "SIGHUP".into(),
        2 => "SIGINT".into(),
        3 => "SIGQUIT".into(),
        4 => "SIGILL".into(),
        6 => "SIGABRT".into(),
        7 => "SIGBUS".into(),
        8 => "SIGFPE".into(),
        9 => "SIGKILL".into(),
        10 => "SIGUSR1".into(),
        11 => "SIGSEGV".into(),
        12 => "SIGUSR2".into(),
        13 => "SIGPIPE".into(),
        14 => "SIGALRM".into(),
        15 => "SIGTERM".into(),
        _ => signal.to_string(),
    }
}
