//! Run driver
//!
//! Executes a resolved plan strictly sequentially in declared order. Owns
//! the single forward-propagating environment map: each test sees the root
//! map plus everything `stdout-to-env` captured before it. A failure under
//! an effective `exit-on-fail = true` halts the run — every later test is
//! recorded as skipped without spawning anything.

use std::time::{Duration, Instant};

use crate::env::EnvMap;
use crate::exec::{execute, Verdict};
use crate::expand::{expand, ExpandContext};
use crate::resolver::{ResolvedRun, ResolvedTest};

/// How a single test ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    Failed,
    /// Not executed because an earlier failure halted the run
    Skipped,
}

/// One line of the run report.
#[derive(Debug)]
pub struct TestRecord {
    pub group: String,
    pub name: String,
    pub outcome: Outcome,
    /// Verdict of the execution attempt; None for skipped tests
    pub verdict: Option<Verdict>,
    /// Expanded command line, when expansion got that far
    pub command_line: Option<String>,
    /// Expanded `output-matches` value, for the save-output collaborator
    pub expected_output: Option<String>,
    pub duration: Duration,
}

/// Ordered results for the whole run.
#[derive(Debug)]
pub struct RunReport {
    pub records: Vec<TestRecord>,
    /// Non-fatal problems hit while setting up the run, one line each
    /// (a root environment value whose substitution failed, for example)
    pub warnings: Vec<String>,
    /// The environment map as it stood after the last executed test
    pub final_env: EnvMap,
    pub duration: Duration,
}

impl RunReport {
    /// Overall success: no failures. Skips count as neither.
    pub fn all_passed(&self) -> bool {
        self.failed_count() == 0
    }

    pub fn passed_count(&self) -> usize {
        self.count(Outcome::Passed)
    }

    pub fn failed_count(&self) -> usize {
        self.count(Outcome::Failed)
    }

    pub fn skipped_count(&self) -> usize {
        self.count(Outcome::Skipped)
    }

    fn count(&self, outcome: Outcome) -> usize {
        self.records.iter().filter(|r| r.outcome == outcome).count()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} tests: {} passed, {} failed, {} skipped ({}ms)",
            self.records.len(),
            self.passed_count(),
            self.failed_count(),
            self.skipped_count(),
            self.duration.as_millis(),
        )
    }
}

/// Run every test of a resolved plan in order.
pub fn run(plan: &ResolvedRun) -> RunReport {
    let start = Instant::now();

    // Seed the shared map and apply root environment overrides, each value
    // expanded against the map as it stands when that value is defined. A
    // value whose substitution fails is left unset and reported as a
    // warning; the run itself goes on.
    let mut shared = EnvMap::root(&plan.config_path);
    let mut warnings = Vec::new();
    for (key, value) in &plan.root_env {
        let ctx = ExpandContext {
            env: &shared,
            chdir: None,
            timeout: plan.root_settings.timeout,
        };
        match expand(value, &ctx) {
            Ok(expanded) => shared.set(key.clone(), expanded),
            Err(e) => warnings.push(format!("environment.{}: {}", key, e)),
        }
    }

    let mut records = Vec::with_capacity(plan.tests.len());
    let mut halted = false;

    for test in &plan.tests {
        if halted {
            records.push(TestRecord {
                group: test.group.clone(),
                name: test.name().to_string(),
                outcome: Outcome::Skipped,
                verdict: None,
                command_line: None,
                expected_output: None,
                duration: Duration::ZERO,
            });
            continue;
        }

        let test_start = Instant::now();
        let execution = match effective_env(test, &shared) {
            Ok(env) => execute(test, &env),
            // A bad substitution in the test's own environment layer fails
            // that test, not the whole run.
            Err((key, e)) => crate::exec::Execution {
                verdict: Verdict::failed_before_spawn(format!("environment.{}: {}", key, e)),
                command_line: None,
                expected_output: None,
                executed: false,
            },
        };

        // Forward-propagate captured output, but only for a test that
        // actually ran its command.
        if execution.executed {
            if let Some(ref var) = test.spec.stdout_to_env {
                shared.set(var.clone(), execution.verdict.output_lossy());
            }
        }

        let outcome = if execution.verdict.passed {
            Outcome::Passed
        } else {
            Outcome::Failed
        };
        if outcome == Outcome::Failed && test.settings.exit_on_fail {
            halted = true;
        }

        records.push(TestRecord {
            group: test.group.clone(),
            name: test.name().to_string(),
            outcome,
            verdict: Some(execution.verdict),
            command_line: execution.command_line,
            expected_output: execution.expected_output,
            duration: test_start.elapsed(),
        });
    }

    RunReport {
        records,
        warnings,
        final_env: shared,
        duration: start.elapsed(),
    }
}

/// Build the test's effective environment: the shared forward map overlaid
/// with the test's scope layers. Each entry is expanded against the map as
/// it stood when that entry was defined.
fn effective_env(
    test: &ResolvedTest,
    shared: &EnvMap,
) -> std::result::Result<EnvMap, (String, crate::expand::ExpandError)> {
    let mut env = shared.clone();
    for layer in &test.env_layers {
        for (key, value) in layer {
            let ctx = ExpandContext {
                env: &env,
                chdir: None,
                timeout: test.settings.timeout,
            };
            let expanded = expand(value, &ctx).map_err(|e| (key.clone(), e))?;
            env.set(key.clone(), expanded);
        }
    }
    Ok(env)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::resolve;
    use std::io::Write;
    use std::path::{Path, PathBuf};

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("bugger.json");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    fn run_json(body: &str) -> RunReport {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), body);
        let plan = resolve(&path).unwrap();
        run(&plan)
    }

    #[test]
    fn failure_without_exit_on_fail_does_not_halt() {
        let report = run_json(
            r#"{
                "command_groups": {
                    "g": [
                        {"name": "boom", "system": "exit 1"},
                        {"name": "after", "system": "true"}
                    ]
                }
            }"#,
        );
        assert_eq!(report.records[0].outcome, Outcome::Failed);
        assert_eq!(report.records[1].outcome, Outcome::Passed);
        assert!(!report.all_passed());
    }

    #[test]
    fn exit_on_fail_skips_the_rest_of_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let witness = dir.path().join("witness");
        let body = format!(
            r#"{{
                "settings": {{"exit-on-fail": true}},
                "command_groups": {{
                    "first": [
                        {{"name": "boom", "system": "exit 1"}},
                        {{"name": "same-group", "system": "touch {w}"}}
                    ],
                    "second": [
                        {{"name": "later-group", "system": "touch {w}"}}
                    ]
                }}
            }}"#,
            w = witness.display(),
        );
        let path = write_config(dir.path(), &body);
        let plan = resolve(&path).unwrap();
        let report = run(&plan);

        assert_eq!(report.records[0].outcome, Outcome::Failed);
        assert_eq!(report.records[1].outcome, Outcome::Skipped);
        assert_eq!(report.records[2].outcome, Outcome::Skipped);
        // skipped tests were never spawned
        assert!(!witness.exists());
        assert_eq!(report.skipped_count(), 2);
    }

    #[test]
    fn stdout_to_env_propagates_forward_untrimmed() {
        let report = run_json(
            r#"{
                "command_groups": {
                    "g": [
                        {"name": "emit", "system": "echo abc123", "stdout-to-env": "SID"},
                        {"name": "use", "system": "printf %s \"$SID\"",
                         "output-matches": "abc123\n"}
                    ]
                }
            }"#,
        );
        assert_eq!(report.records[1].outcome, Outcome::Passed, "{:?}", report.records[1]);
        assert_eq!(report.final_env.get("SID"), Some("abc123\n"));
    }

    #[test]
    fn stdout_to_env_is_unavailable_to_earlier_tests() {
        let report = run_json(
            r#"{
                "command_groups": {
                    "g": [
                        {"name": "before", "system": "printf %s \"${SID:-unset}\"",
                         "output-matches": "unset"},
                        {"name": "emit", "system": "echo abc", "stdout-to-env": "SID"}
                    ]
                }
            }"#,
        );
        assert_eq!(report.records[0].outcome, Outcome::Passed);
    }

    #[test]
    fn output_matches_is_byte_exact() {
        let report = run_json(
            r#"{
                "command_groups": {
                    "g": [
                        {"name": "newline", "system": "echo hi", "output-matches": "hi"},
                        {"name": "exact", "system": "echo hi", "output-matches": "hi\n"}
                    ]
                }
            }"#,
        );
        assert_eq!(report.records[0].outcome, Outcome::Failed);
        assert_eq!(report.records[1].outcome, Outcome::Passed);
    }

    #[test]
    fn timeout_is_reported_as_timed_out() {
        let report = run_json(
            r#"{
                "command_groups": {
                    "g": [
                        {"name": "slow", "system": "sleep 5",
                         "settings": {"timeout": 1}}
                    ]
                }
            }"#,
        );
        let record = &report.records[0];
        assert_eq!(record.outcome, Outcome::Failed);
        let verdict = record.verdict.as_ref().unwrap();
        assert!(verdict.timed_out);
        assert!(verdict.signal.is_none());
        assert_eq!(verdict.failure_reasons, vec!["timeout"]);
    }

    #[test]
    fn background_process_does_not_stall_the_run() {
        let start = Instant::now();
        let report = run_json(
            r#"{
                "command_groups": {
                    "g": [
                        {"name": "daemonish", "system": "sleep 6 & exit 0",
                         "settings": {"timeout": 1}}
                    ]
                }
            }"#,
        );
        // the backgrounded sleep holds the capture pipe open past the
        // child's exit; the timeout still bounds the whole test
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(report.records[0].outcome, Outcome::Passed, "{:?}", report.records[0]);
    }

    #[test]
    fn bad_root_environment_entry_warns_and_stays_unset() {
        let report = run_json(
            r#"{
                "environment": {"BAD": "$(exit 3)", "OK": "fine"},
                "command_groups": {
                    "g": [
                        {"name": "sees-unset", "system": "printf %s \"${BAD:-unset}\"",
                         "output-matches": "unset"},
                        {"name": "sees-ok", "system": "printf %s \"$OK\"",
                         "output-matches": "fine"}
                    ]
                }
            }"#,
        );
        assert_eq!(report.warnings.len(), 1, "{:?}", report.warnings);
        assert!(report.warnings[0].contains("environment.BAD"));
        assert_eq!(report.records[0].outcome, Outcome::Passed, "{:?}", report.records[0]);
        assert_eq!(report.records[1].outcome, Outcome::Passed);
    }

    #[test]
    fn output_matches_never_equates_invalid_utf8_with_replacement() {
        // \377 is not valid UTF-8; an expected string spelled with U+FFFD
        // must not match it
        let report = run_json(
            r#"{
                "command_groups": {
                    "g": [
                        {"name": "raw", "system": "printf '\\377'",
                         "output-matches": "�"}
                    ]
                }
            }"#,
        );
        assert_eq!(report.records[0].outcome, Outcome::Failed);
        let reasons = &report.records[0].verdict.as_ref().unwrap().failure_reasons;
        assert!(reasons.iter().any(|r| r.contains("does not match")), "{:?}", reasons);
    }

    #[test]
    fn negated_contains() {
        let report = run_json(
            r#"{
                "command_groups": {
                    "g": [
                        {"name": "clean", "system": "echo build ok",
                         "!output-contains": ["ERROR"]},
                        {"name": "dirty", "system": "echo 'ERROR: build failed'",
                         "!output-contains": ["ERROR"]}
                    ]
                }
            }"#,
        );
        assert_eq!(report.records[0].outcome, Outcome::Passed);
        assert_eq!(report.records[1].outcome, Outcome::Failed);
    }

    #[test]
    fn expected_exit_code_override() {
        let report = run_json(
            r#"{
                "command_groups": {
                    "g": [
                        {"name": "grep-miss", "system": "exit 1",
                         "settings": {"expected-exit-code": 1}}
                    ]
                }
            }"#,
        );
        assert_eq!(report.records[0].outcome, Outcome::Passed);
    }

    #[test]
    fn success_command_gates_the_verdict() {
        let report = run_json(
            r#"{
                "command_groups": {
                    "g": [
                        {"name": "ok", "system": "true", "success-command": "true"},
                        {"name": "bad", "system": "true", "success-command": "exit 1"}
                    ]
                }
            }"#,
        );
        assert_eq!(report.records[0].outcome, Outcome::Passed);
        assert_eq!(report.records[1].outcome, Outcome::Failed);
        let reasons = &report.records[1].verdict.as_ref().unwrap().failure_reasons;
        assert!(reasons[0].contains("success command"));
    }

    #[test]
    fn failing_substitution_fails_only_that_test() {
        let report = run_json(
            r#"{
                "command_groups": {
                    "g": [
                        {"name": "bad", "system": "echo $(exit 7)"},
                        {"name": "fine", "system": "true"}
                    ]
                }
            }"#,
        );
        assert_eq!(report.records[0].outcome, Outcome::Failed);
        let reasons = &report.records[0].verdict.as_ref().unwrap().failure_reasons;
        assert!(reasons[0].contains("substitution failed"));
        assert_eq!(report.records[1].outcome, Outcome::Passed);
    }

    #[test]
    fn environment_scopes_layer_root_include_test() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("inc.json"),
            r#"[{"name": "t", "system": "printf %s \"$WHO\"",
                 "environment": {"WHO": "${WHO}-test"},
                 "output-matches": "root-inc-test"}]"#,
        )
        .unwrap();
        let path = write_config(
            dir.path(),
            r#"{
                "environment": {"WHO": "root"},
                "command_groups": {
                    "g": {"include": "inc.json", "environment": {"WHO": "${WHO}-inc"}}
                }
            }"#,
        );
        let plan = resolve(&path).unwrap();
        let report = run(&plan);
        assert_eq!(report.records[0].outcome, Outcome::Passed, "{:?}", report.records[0]);
    }
}
