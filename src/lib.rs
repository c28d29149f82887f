//! bugger: a declarative test runner
//!
//! Tests are external commands with success criteria, described in a single
//! `bugger.json` file and run strictly in declared order.
//!
//! # Config format
//!
//! ```json
//! {
//!     "environment": {"CC": "gcc"},
//!     "settings": {"timeout": 30, "exit-on-fail": true},
//!     "command_groups": {
//!         "build": [
//!             {"name": "compile", "system": "${CC} -o app main.c"},
//!             {"name": "binary exists", "exec": "/usr/bin/test",
//!              "arguments": ["-x", "app"]}
//!         ],
//!         "smoke": {"include": "tests/smoke.json",
//!                   "environment": {"TARGET": "./app"}}
//!     }
//! }
//! ```
//!
//! # Test keys
//!
//! | Key | Description |
//! |-----|-------------|
//! | `name` | Display name (required) |
//! | `system` | Command string, run through a shell |
//! | `exec` / `arguments` | Program path and argv, no shell |
//! | `settings` | Per-test overrides (timeout, chdir, expected-exit-code, ...) |
//! | `environment` | Per-test variable overrides |
//! | `stdout-to-env` | Store captured output in a variable for later tests |
//! | `output-contains` | Substrings that must appear in the output |
//! | `!output-contains` | Substrings that must not appear |
//! | `output-matches` | Exact expected output (byte-for-byte) |
//! | `success-command` | Shell command that must exit 0 |
//!
//! # Expansion
//!
//! Every user-facing string may use `${VAR}`, `${VAR:-default}`,
//! `${VAR|filter|...}` and `$(shell command)`. Substituted values are
//! inserted literally and never re-expanded. Filters are a closed registry:
//! `strip`, `lstrip`, `rstrip`, `upper`, `lower`, `title`, `capitalize`,
//! `swapcase`.
//!
//! Settings and environment resolve per scope: root ← group/include ← test.
//! `exit-on-fail` halts the run after a failure; the remaining tests are
//! reported as skipped.

mod config;
mod env;
mod error;
mod exec;
mod expand;
mod resolver;
mod runner;
mod save;

pub use config::{Config, Criterion, GroupSource, IncludeRef, Settings, SettingsPatch, StringOrList, TestSpec};
pub use env::EnvMap;
pub use error::{Error, Result};
pub use exec::{execute, signal_name, Captured, Execution, Verdict};
pub use expand::{check, expand, ExpandContext, ExpandError, FILTER_NAMES};
pub use resolver::{resolve, resolve_config, CommandForm, ResolvedRun, ResolvedTest};
pub use runner::{run, Outcome, RunReport, TestRecord};
pub use save::save_report;
