//! Config resolution
//!
//! Walks the command-group tree in declared order, splices `include`
//! references in place, merges settings per scope (root ← include ← test),
//! and emits a flat ordered execution plan. Environment layers stay
//! symbolic here — expansion is deferred to execution time because values
//! may reference outputs of earlier tests.
//!
//! All configuration errors surface from this pass, before any test runs:
//! missing `command_groups`, neither/both of `system`/`exec`, unreadable or
//! malformed include files, include cycles, and statically invalid
//! expansion syntax (unbalanced brackets, unknown filter names).

use std::path::{Path, PathBuf};

use crate::config::{Config, GroupSource, Settings, SettingsPatch, StringOrList, TestSpec};
use crate::error::{Error, Result};
use crate::expand;

/// The flat, fully scoped execution plan for one invocation.
#[derive(Debug)]
pub struct ResolvedRun {
    /// Absolute path of the top-level config file
    pub config_path: PathBuf,
    pub root_settings: Settings,
    /// Root environment overrides, symbolic, in declared order
    pub root_env: Vec<(String, String)>,
    /// Tests in execution order
    pub tests: Vec<ResolvedTest>,
}

/// One test with its merged settings and symbolic environment layers.
#[derive(Debug)]
pub struct ResolvedTest {
    pub group: String,
    pub spec: TestSpec,
    /// Fully merged settings record (root ← include ← test)
    pub settings: Settings,
    /// Scope layers above the shared root map, outermost first. Each layer
    /// is applied in declared order at execution time.
    pub env_layers: Vec<Vec<(String, String)>>,
    /// File the test was declared in (for diagnostics)
    pub origin: PathBuf,
}

impl ResolvedTest {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn command(&self) -> CommandForm<'_> {
        // Validation guarantees exactly one form is present.
        match self.spec.system {
            Some(ref s) => CommandForm::System(s),
            None => CommandForm::Exec {
                path: self.spec.exec.as_deref().unwrap_or_default(),
                args: &self.spec.arguments,
            },
        }
    }
}

/// The two ways a test names its command.
pub enum CommandForm<'a> {
    /// Run the string through a shell
    System(&'a str),
    /// Invoke the path directly with argv, no shell interpretation
    Exec { path: &'a str, args: &'a [String] },
}

/// Load the root config file and resolve it into an execution plan.
pub fn resolve(config_path: &Path) -> Result<ResolvedRun> {
    let config = Config::load(config_path)?;
    resolve_config(config, config_path)
}

/// Resolve an already-parsed config tree.
pub fn resolve_config(config: Config, config_path: &Path) -> Result<ResolvedRun> {
    let config_path = config_path
        .canonicalize()
        .unwrap_or_else(|_| config_path.to_path_buf());
    let config_dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let groups = config.command_groups.ok_or_else(|| {
        Error::config(&config_path, "command_groups", "no command groups section found")
    })?;

    for (key, value) in &config.environment {
        check_template(&config_path, &format!("environment.{}", key), value)?;
    }
    check_settings(&config_path, "settings", &config.settings)?;

    let mut tests = Vec::new();
    let mut resolving = vec![config_path.clone()];

    for (group_name, source) in groups {
        // Groups prefixed with '_' are disabled outright.
        if group_name.starts_with('_') {
            continue;
        }
        match source {
            GroupSource::Tests(specs) => {
                for spec in specs {
                    tests.push(resolve_test(
                        spec,
                        &group_name,
                        &config_path,
                        &config.settings,
                        None,
                    )?);
                }
            }
            GroupSource::Include(inc) => {
                let include_path = normalize_include_path(&config_dir, &inc.include);
                if resolving.contains(&include_path) {
                    return Err(Error::config(
                        &config_path,
                        format!("command_groups.{}", group_name),
                        format!("circular include of {}", include_path.display()),
                    ));
                }
                resolving.push(include_path.clone());

                check_settings(
                    &config_path,
                    &format!("command_groups.{}.settings", group_name),
                    &inc.settings,
                )?;
                for (key, value) in &inc.environment {
                    check_template(
                        &config_path,
                        &format!("command_groups.{}.environment.{}", group_name, key),
                        value,
                    )?;
                }

                let specs = load_include(&include_path)?;
                for spec in specs {
                    // Includes inherit from the root scope plus their own
                    // explicit override — the including group's scope does
                    // not leak in.
                    tests.push(resolve_test(
                        spec,
                        &group_name,
                        &include_path,
                        &config.settings,
                        Some((&inc.environment, &inc.settings)),
                    )?);
                }
                resolving.pop();
            }
        }
    }

    Ok(ResolvedRun {
        config_path,
        root_settings: config.settings.resolve(),
        root_env: config.environment,
        tests,
    })
}

fn normalize_include_path(config_dir: &Path, include: &str) -> PathBuf {
    let raw = config_dir.join(include);
    raw.canonicalize().unwrap_or(raw)
}

fn load_include(path: &Path) -> Result<Vec<TestSpec>> {
    let data = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    serde_json::from_str(&data).map_err(|e| Error::Json {
        path: path.to_path_buf(),
        source: e,
    })
}

fn resolve_test(
    spec: TestSpec,
    group: &str,
    origin: &Path,
    root_settings: &SettingsPatch,
    include_layer: Option<(&Vec<(String, String)>, &SettingsPatch)>,
) -> Result<ResolvedTest> {
    let context = format!("group {:?}, test {:?}", group, spec.name);

    if spec.name.is_empty() {
        return Err(Error::config(origin, format!("group {:?}", group), "test has an empty name"));
    }
    match (&spec.system, &spec.exec) {
        (Some(_), Some(_)) => {
            return Err(Error::config(
                origin,
                context,
                "\"system\" and \"exec\" are mutually exclusive",
            ))
        }
        (None, None) => {
            return Err(Error::config(
                origin,
                context,
                "one of \"system\" or \"exec\" is required",
            ))
        }
        _ => {}
    }

    let (include_env, include_settings) = match include_layer {
        Some((env, settings)) => (env.clone(), settings.clone()),
        None => (Vec::new(), SettingsPatch::default()),
    };

    let merged = spec
        .settings
        .over(&include_settings)
        .over(root_settings);
    check_settings(origin, &context, &merged)?;

    let mut env_layers = Vec::new();
    if !include_env.is_empty() {
        env_layers.push(include_env);
    }
    if !spec.environment.is_empty() {
        env_layers.push(spec.environment.clone());
    }

    let resolved = ResolvedTest {
        group: group.to_string(),
        spec,
        settings: merged.resolve(),
        env_layers,
        origin: origin.to_path_buf(),
    };
    check_test_templates(&resolved, &context)?;
    Ok(resolved)
}

/// Static expansion check over every expandable string of a test.
fn check_test_templates(test: &ResolvedTest, context: &str) -> Result<()> {
    let origin = &test.origin;
    let mut check = |field: &str, value: &str| -> Result<()> {
        check_template(origin, &format!("{}: {}", context, field), value)
    };

    if let Some(ref s) = test.spec.system {
        check("system", s)?;
    }
    if let Some(ref s) = test.spec.exec {
        check("exec", s)?;
    }
    for arg in &test.spec.arguments {
        check("arguments", arg)?;
    }
    for layer in &test.env_layers {
        for (key, value) in layer {
            check(&format!("environment.{}", key), value)?;
        }
    }
    check_string_or_list(&mut check, "output-contains", &test.spec.output_contains)?;
    check_string_or_list(&mut check, "!output-contains", &test.spec.output_not_contains)?;
    check_string_or_list(&mut check, "output-matches", &test.spec.output_matches)?;
    if let Some(ref s) = test.spec.success_command {
        check("success-command", s)?;
    }
    Ok(())
}

fn check_string_or_list(
    check: &mut impl FnMut(&str, &str) -> Result<()>,
    field: &str,
    value: &Option<StringOrList>,
) -> Result<()> {
    if let Some(ref v) = value {
        for s in v.to_vec() {
            check(field, &s)?;
        }
    }
    Ok(())
}

fn check_settings(origin: &Path, context: &str, settings: &SettingsPatch) -> Result<()> {
    if let Some(ref chdir) = settings.chdir {
        check_template(origin, &format!("{}: chdir", context), chdir)?;
    }
    if let Some(ref save) = settings.save_output {
        check_template(origin, &format!("{}: save-output", context), save)?;
    }
    Ok(())
}

fn check_template(origin: &Path, context: &str, template: &str) -> Result<()> {
    expand::check(template).map_err(|e| Error::config(origin, context, e.to_string()))
}
