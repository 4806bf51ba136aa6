//! `run`: execute tests against the connected board.

use anyhow::Result;
use console::style;
use dutprobe::{Session, SessionConfig, TestKind, TestOutcome, run_tests};
use indicatif::{ProgressBar, ProgressStyle};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::{Cli, CliError, get_port, use_fancy_output, was_interrupted};

/// Run `kinds` in order on one session.
///
/// Exits with code 1 when any test failed.
pub(crate) fn cmd_run(
    cli: &Cli,
    config: &mut Config,
    kinds: &[TestKind],
    json: bool,
) -> Result<ExitCode> {
    let port = get_port(cli, config)?;
    let device = config.device_params();
    let timing = config.timing();

    let mut session_config = SessionConfig::new(&port);
    if let Some(baud) = cli.baud.or(config.connection.baud) {
        session_config = session_config.with_boot_baud(baud);
    }
    if let Some(baud) = cli.os_baud.or(config.connection.os_baud) {
        session_config = session_config.with_os_baud(baud);
    }
    if let Some(timeout) = config.module_timeout() {
        session_config = session_config.with_module_timeout(timeout);
    }

    let pb = if cli.quiet || !use_fancy_output() {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new_spinner();
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {prefix:.bold} {msg}")
                .unwrap(),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb.enable_steady_tick(Duration::from_millis(120));
        pb
    };

    let mut session = Session::native(session_config);
    session.set_interrupt(Arc::new(was_interrupted));
    if !cli.quiet {
        let printer = pb.clone();
        let fancy = use_fancy_output();
        session.set_sink(Some(Box::new(move |line: &str| {
            if fancy {
                printer.println(line);
            } else {
                eprintln!("{line}");
            }
        })));
    }
    let stage_bar = pb.clone();
    session.on_stage_change(Box::new(move |stage| stage_bar.set_message(stage.to_string())));

    let outcomes = run_tests(kinds, &device, &timing, &mut session, |kind| {
        pb.set_prefix(kind.name());
    });
    pb.finish_and_clear();

    print_summary(&outcomes, cli.quiet);
    if json {
        println!("{}", serde_json::to_string_pretty(&summary_json(&outcomes))?);
    }

    if was_interrupted() {
        return Err(CliError::Cancelled(format!(
            "Interrupted after {} of {} tests",
            outcomes.len(),
            kinds.len()
        ))
        .into());
    }

    Ok(if outcomes.iter().all(TestOutcome::passed) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_summary(outcomes: &[TestOutcome], quiet: bool) {
    if !quiet {
        eprintln!();
    }
    for outcome in outcomes {
        let label = match outcome.label() {
            "PASS" => style(outcome.label()).green().bold(),
            "PARSE ERROR" => style(outcome.label()).yellow().bold(),
            _ => style(outcome.label()).red().bold(),
        };
        let reason = outcome
            .failure
            .as_ref()
            .map(|f| format!(" ({})", f.message))
            .unwrap_or_default();
        eprintln!("{:<12} {label}{}", outcome.name, style(reason).dim());
    }
}

fn summary_json(outcomes: &[TestOutcome]) -> serde_json::Value {
    let tests: Vec<serde_json::Value> = outcomes
        .iter()
        .map(|o| {
            serde_json::json!({
                "name": o.name,
                "verdict": o.label(),
                "passed": o.passed(),
                "failure": o.failure,
                "extract": o.extract,
                "elapsed_ms": u64::try_from(o.elapsed.as_millis()).unwrap_or(u64::MAX),
            })
        })
        .collect();

    serde_json::json!({
        "passed": outcomes.iter().all(TestOutcome::passed),
        "tests": tests,
    })
}
