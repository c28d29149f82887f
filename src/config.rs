//! Configuration data model
//!
//! Serde types mirroring the `bugger.json` format, plus the field-wise
//! settings merge (root ← group/include ← test). Declaration order of both
//! environment entries and command groups is significant, so JSON objects
//! for those are deserialized into ordered pair lists.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};

/// Top-level `bugger.json` document.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Root environment overrides, expansion-eligible, in declared order
    #[serde(default, deserialize_with = "ordered_string_map")]
    pub environment: Vec<(String, String)>,
    /// Root settings (all fields optional)
    #[serde(default)]
    pub settings: SettingsPatch,
    /// Group name → tests or include reference, in declared order
    #[serde(default, deserialize_with = "ordered_group_map")]
    pub command_groups: Option<Vec<(String, GroupSource)>>,
}

impl Config {
    /// Load and parse a config file.
    pub fn load(path: &Path) -> Result<Config> {
        let data = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        serde_json::from_str(&data).map_err(|e| Error::Json {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// The body of one command group: inline tests, or a reference to another
/// file of tests with an extra override layer.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum GroupSource {
    Tests(Vec<TestSpec>),
    Include(IncludeRef),
}

/// `{include, environment?, settings?}` — splice in tests from another file,
/// layered over the root scope plus these explicit overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct IncludeRef {
    pub include: String,
    #[serde(default, deserialize_with = "ordered_string_map")]
    pub environment: Vec<(String, String)>,
    #[serde(default)]
    pub settings: SettingsPatch,
}

/// One test as declared in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct TestSpec {
    pub name: String,
    /// Shell-interpreted command string (exactly one of `system`/`exec`)
    pub system: Option<String>,
    /// Program path for direct execution, no shell
    pub exec: Option<String>,
    /// Arguments for the `exec` form
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub settings: SettingsPatch,
    #[serde(default, deserialize_with = "ordered_string_map")]
    pub environment: Vec<(String, String)>,
    /// Capture this test's output into the named variable for later tests
    #[serde(rename = "stdout-to-env")]
    pub stdout_to_env: Option<String>,
    #[serde(rename = "output-contains")]
    pub output_contains: Option<StringOrList>,
    #[serde(rename = "!output-contains")]
    pub output_not_contains: Option<StringOrList>,
    #[serde(rename = "output-matches")]
    pub output_matches: Option<StringOrList>,
    #[serde(rename = "success-command")]
    pub success_command: Option<String>,
}

impl TestSpec {
    /// Success criteria in evaluation order. All must hold (logical AND).
    pub fn criteria(&self) -> Vec<Criterion> {
        let mut out = Vec::new();
        if let Some(ref c) = self.output_contains {
            out.push(Criterion::OutputContains {
                needles: c.to_vec(),
                negate: false,
            });
        }
        if let Some(ref c) = self.output_not_contains {
            out.push(Criterion::OutputContains {
                needles: c.to_vec(),
                negate: true,
            });
        }
        if let Some(ref m) = self.output_matches {
            // A list form is joined with newlines, one element per line.
            out.push(Criterion::OutputMatches(m.join_lines()));
        }
        if let Some(ref cmd) = self.success_command {
            out.push(Criterion::SuccessCommand(cmd.clone()));
        }
        out
    }
}

/// A single success criterion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Criterion {
    /// Each needle must be present (or absent, when negated) in the output
    OutputContains { needles: Vec<String>, negate: bool },
    /// Output must equal this byte-for-byte, trailing newline included
    OutputMatches(String),
    /// Shell command that must exit 0
    SuccessCommand(String),
}

/// A JSON field that accepts either a string or a list of strings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::One(s) => vec![s.clone()],
            Self::Many(v) => v.clone(),
        }
    }

    pub fn join_lines(&self) -> String {
        match self {
            Self::One(s) => s.clone(),
            Self::Many(v) => v.join("\n"),
        }
    }
}

/// Partial settings as written in a config scope. Unset fields fall through
/// to the parent scope's resolved value.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct SettingsPatch {
    /// Seconds before the command is killed
    pub timeout: Option<f64>,
    pub exit_on_fail: Option<bool>,
    pub chdir: Option<String>,
    pub expected_exit_code: Option<i32>,
    pub animation: Option<bool>,
    pub enable_collapse: Option<bool>,
    pub save_output: Option<String>,
}

impl SettingsPatch {
    /// Field-wise merge: fields set on `self` win, the rest come from `base`.
    pub fn over(&self, base: &SettingsPatch) -> SettingsPatch {
        SettingsPatch {
            timeout: self.timeout.or(base.timeout),
            exit_on_fail: self.exit_on_fail.or(base.exit_on_fail),
            chdir: self.chdir.clone().or_else(|| base.chdir.clone()),
            expected_exit_code: self.expected_exit_code.or(base.expected_exit_code),
            animation: self.animation.or(base.animation),
            enable_collapse: self.enable_collapse.or(base.enable_collapse),
            save_output: self.save_output.clone().or_else(|| base.save_output.clone()),
        }
    }

    /// Resolve to concrete settings, filling unset fields with the defaults.
    pub fn resolve(&self) -> Settings {
        let defaults = Settings::default();
        Settings {
            timeout: self
                .timeout
                .map(Duration::from_secs_f64)
                .unwrap_or(defaults.timeout),
            exit_on_fail: self.exit_on_fail.unwrap_or(defaults.exit_on_fail),
            chdir: self.chdir.clone(),
            expected_exit_code: self
                .expected_exit_code
                .unwrap_or(defaults.expected_exit_code),
            animation: self.animation.unwrap_or(defaults.animation),
            enable_collapse: self.enable_collapse.unwrap_or(defaults.enable_collapse),
            save_output: self.save_output.clone(),
        }
    }
}

/// Fully resolved settings for one test.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub timeout: Duration,
    pub exit_on_fail: bool,
    pub chdir: Option<String>,
    pub expected_exit_code: i32,
    pub animation: bool,
    pub enable_collapse: bool,
    pub save_output: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            exit_on_fail: false,
            chdir: None,
            expected_exit_code: 0,
            animation: true,
            enable_collapse: true,
            save_output: None,
        }
    }
}

/// Deserialize a JSON object into ordered (key, value) pairs. Declaration
/// order drives both expansion order and execution order, which a plain
/// `HashMap` would lose.
fn ordered_string_map<'de, D>(deserializer: D) -> std::result::Result<Vec<(String, String)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct PairVisitor;

    impl<'de> Visitor<'de> for PairVisitor {
        type Value = Vec<(String, String)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of string to string")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
            let mut pairs = Vec::new();
            while let Some(pair) = map.next_entry::<String, String>()? {
                pairs.push(pair);
            }
            Ok(pairs)
        }
    }

    deserializer.deserialize_map(PairVisitor)
}

fn ordered_group_map<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Vec<(String, GroupSource)>>, D::Error>
where
    D: Deserializer<'de>,
{
    struct GroupVisitor;

    impl<'de> Visitor<'de> for GroupVisitor {
        type Value = Vec<(String, GroupSource)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of group name to tests or include")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
            let mut pairs = Vec::new();
            while let Some(pair) = map.next_entry::<String, GroupSource>()? {
                pairs.push(pair);
            }
            Ok(pairs)
        }
    }

    deserializer.deserialize_map(GroupVisitor).map(Some)
}
