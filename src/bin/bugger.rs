//! bugger CLI
//!
//! Run the tests declared in a bugger.json file.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;

use bugger::{expand, ExpandContext, Outcome, RunReport, FILTER_NAMES};

#[derive(Parser, Debug)]
#[command(name = "bugger")]
#[command(version)]
#[command(about = "Run tests declared in a bugger.json file")]
struct Cli {
    /// Config file to run
    #[arg(default_value = "./bugger.json")]
    config: PathBuf,

    /// Show captured output for failed tests
    #[arg(short, long)]
    verbose: bool,

    /// List available expansion filters
    #[arg(long = "list-filters")]
    list_filters: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.list_filters {
        println!("Expansion filters:");
        for name in FILTER_NAMES {
            println!("  {}", name);
        }
        return ExitCode::SUCCESS;
    }

    if !cli.config.is_file() {
        eprintln!("error: {} is missing or not a file", cli.config.display());
        return ExitCode::FAILURE;
    }

    let plan = match bugger::resolve(&cli.config) {
        Ok(plan) => plan,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let report = bugger::run(&plan);
    for warning in &report.warnings {
        eprintln!("warning: {}", warning);
    }

    print_report(&report, cli.verbose);

    if let Some(ref raw) = plan.root_settings.save_output {
        if let Err(e) = save_output(raw, &plan.root_settings.timeout, &report) {
            eprintln!("error: could not save output: {}", e);
            return ExitCode::FAILURE;
        }
    }

    if report.all_passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn print_report(report: &RunReport, verbose: bool) {
    let mut current_group: Option<&str> = None;

    for record in &report.records {
        if current_group != Some(record.group.as_str()) {
            println!("{}", record.group);
            current_group = Some(&record.group);
        }
        match record.outcome {
            Outcome::Passed => {
                println!("  PASS  {} ({}ms)", record.name, record.duration.as_millis());
            }
            Outcome::Skipped => {
                println!("  SKIP  {}", record.name);
            }
            Outcome::Failed => {
                println!("  FAIL  {} ({}ms)", record.name, record.duration.as_millis());
                if let Some(ref command) = record.command_line {
                    println!("        $ {}", command);
                }
                if let Some(ref verdict) = record.verdict {
                    for reason in &verdict.failure_reasons {
                        for line in reason.lines() {
                            println!("        {}", line);
                        }
                    }
                    if verbose && !verdict.captured_output.is_empty() {
                        println!("        --- output ---");
                        for line in verdict.output_lossy().lines() {
                            println!("        {}", line);
                        }
                    }
                }
            }
        }
    }

    println!();
    println!("{}", report.summary());
}

/// Expand the save-output path against the final environment and persist
/// the report under it.
fn save_output(raw: &str, timeout: &Duration, report: &RunReport) -> anyhow::Result<()> {
    let ctx = ExpandContext {
        env: &report.final_env,
        chdir: None,
        timeout: *timeout,
    };
    let dir = expand(raw, &ctx)?;
    bugger::save_report(PathBuf::from(dir).as_path(), report)?;
    Ok(())
}
