use anyhow::Context;
use assay_kernel::{read_segment, verify_chain, TaskState, WorkflowStatus};
use clap::{Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("assay-kernel")
        .version(assay_kernel::VERSION)
        .about("Inspect durable workflow logs")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("verify")
                .about("Verify the hash chain of a workflow log")
                .arg(
                    Arg::new("log")
                        .long("log")
                        .required(true)
                        .value_parser(clap::value_parser!(PathBuf))
                        .help("Path to a workflow log segment (.jsonl)"),
                ),
        )
        .subcommand(
            Command::new("replay")
                .about("Rebuild workflow state from its log")
                .arg(
                    Arg::new("log")
                        .long("log")
                        .required(true)
                        .value_parser(clap::value_parser!(PathBuf))
                        .help("Path to a workflow log segment (.jsonl)"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output the rebuilt state as JSON"),
                ),
        )
}

fn log_path(args: &ArgMatches) -> anyhow::Result<&PathBuf> {
    args.get_one::<PathBuf>("log").context("--log is required")
}

fn verify(args: &ArgMatches) -> anyhow::Result<()> {
    let path = log_path(args)?;
    let records =
        read_segment(path).with_context(|| format!("reading {}", path.display()))?;
    verify_chain(&records).context("log integrity check failed")?;

    println!("Log integrity: VALID");
    println!("Events checked: {}", records.len());
    if let Some(last) = records.last() {
        println!("Workflow: {}", last.workflow_id);
        println!("Head hash: {}", last.hash);
    }
    Ok(())
}

fn replay(args: &ArgMatches) -> anyhow::Result<()> {
    let path = log_path(args)?;
    let records =
        read_segment(path).with_context(|| format!("reading {}", path.display()))?;
    verify_chain(&records).context("log integrity check failed")?;
    let status = WorkflowStatus::replay(&records).context("replay failed")?;

    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("Workflow Report");
    println!("===============");
    println!();
    println!("Workflow: {} ({})", status.workflow_id, status.workflow_type);
    println!("State: {}", status.state);
    println!("Version: {}", status.version);
    println!("Events: {}", records.len());
    if let Some(error) = &status.error {
        println!("Error: {error}");
    }
    println!();
    println!("Tasks:");
    for task in &status.tasks {
        let mut notes = Vec::new();
        if task.retry_count > 0 {
            notes.push(format!("retries={}", task.retry_count));
        }
        if task.is_compensated() {
            notes.push("compensated".to_string());
        }
        if let Some(valid) = task.validation() {
            notes.push(format!("validated={valid}"));
        }
        println!(
            "  {:<24} {:<20} {:<10} {}",
            task.id().to_string(),
            format!("{}@{}", task.spec.algorithm, task.spec.version),
            task.state.to_string(),
            notes.join(" ")
        );
    }

    let failed = status
        .tasks
        .iter()
        .filter(|t| t.state == TaskState::Failed)
        .count();
    println!();
    println!("Summary:");
    println!("  Tasks: {}", status.tasks.len());
    println!("  Failed: {failed}");
    println!("  Compensations: {}", status.compensations.len());
    println!("  Experiments: {}", status.experiments.len());
    println!("  Checkpoints: {}", status.checkpoints.len());
    Ok(())
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let matches = cli().get_matches();
    let result = match matches.subcommand() {
        Some(("verify", args)) => verify(args),
        Some(("replay", args)) => replay(args),
        Some((other, _)) => Err(anyhow::anyhow!("unknown command {other}")),
        None => Ok(()),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
