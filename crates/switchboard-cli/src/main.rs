use clap::{Parser, Subcommand};
use serde_json::json;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use switchboard_core::{SwitchboardConfig, ToolCall, ToolResult};
use switchboard_orchestrator::{aggregate_results, GroupProgress, ParallelTask, ParallelTaskGroup};
use switchboard_router::{Switchboard, CHECK_STATUS, DELEGATE, LIST_AGENTS};
use tracing::info;
use tracing_subscriber::EnvFilter;

const CLI_SESSION: &str = "cli";

#[derive(Parser)]
#[command(name = "switchboard", about = "Switchboard — delegate tasks to external agents")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "switchboard.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured agents
    Agents {
        /// Only agents advertising this capability
        #[arg(long)]
        capability: Option<String>,
    },
    /// Delegate one task to one agent
    Delegate {
        #[arg(short, long)]
        agent: String,
        #[arg(short, long)]
        task: String,
        /// Background information prepended to the task
        #[arg(long)]
        context: Option<String>,
        /// Submit in the background and follow the run until it ends
        #[arg(long)]
        no_wait: bool,
    },
    /// Run several delegations concurrently
    Parallel {
        /// AGENT=TASK, repeatable
        #[arg(long = "task", value_parser = parse_assignment, required = true)]
        tasks: Vec<(String, String)>,
        #[arg(long)]
        max_concurrency: Option<usize>,
        /// Deadline for the whole group
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Stop launching tasks after the first failure
        #[arg(long)]
        fail_fast: bool,
    },
    /// Print the delegation actions and their argument schemas
    Actions,
}

fn parse_assignment(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((agent, task)) if !agent.trim().is_empty() && !task.trim().is_empty() => {
            Ok((agent.trim().to_string(), task.trim().to_string()))
        }
        _ => Err(format!("expected AGENT=TASK, got '{raw}'")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();

    let config = SwitchboardConfig::load(&cli.config)?;
    let hub = Switchboard::from_config(config);

    let outcome = match cli.command {
        Commands::Agents { capability } => {
            let arguments = match capability {
                Some(tag) => json!({ "capability": tag }),
                None => json!({}),
            };
            let result = hub.dispatch(ToolCall::new("cli", LIST_AGENTS, arguments)).await;
            print_result(&result)
        }
        Commands::Delegate {
            agent,
            task,
            context,
            no_wait,
        } => {
            let started = hub.auto_spawn().await;
            info!(started, "Auto-spawned agents");
            until_interrupted(delegate(&hub, agent, task, context, no_wait)).await
        }
        Commands::Parallel {
            tasks,
            max_concurrency,
            timeout_secs,
            fail_fast,
        } => {
            let started = hub.auto_spawn().await;
            info!(started, "Auto-spawned agents");
            until_interrupted(parallel(&hub, tasks, max_concurrency, timeout_secs, fail_fast)).await
        }
        Commands::Actions => {
            println!("{}", serde_json::to_string_pretty(&hub.descriptors())?);
            Ok(())
        }
    };

    hub.shutdown().await;
    outcome
}

async fn until_interrupted(work: impl Future<Output = anyhow::Result<()>>) -> anyhow::Result<()> {
    tokio::select! {
        res = work => res,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down...");
            Ok(())
        }
    }
}

async fn delegate(
    hub: &Switchboard,
    agent: String,
    task: String,
    context: Option<String>,
    no_wait: bool,
) -> anyhow::Result<()> {
    let mut arguments = json!({
        "agent_name": agent,
        "task": task,
        "parent_session_id": CLI_SESSION,
        "wait_for_result": !no_wait,
    });
    if let Some(context) = context {
        arguments["context"] = json!(context);
    }
    let result = hub.dispatch(ToolCall::new("cli", DELEGATE, arguments)).await;
    print_result(&result)?;
    if !no_wait {
        return Ok(());
    }

    let accepted = result.payload().unwrap_or_default();
    let Some(run_id) = accepted["run_id"].as_str() else {
        anyhow::bail!("Delegation response carried no run_id");
    };
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let finished = hub
            .tracker()
            .get(run_id)
            .map_or(true, |run| run.status.is_terminal());
        if finished {
            break;
        }
    }
    let status = hub
        .dispatch(ToolCall::new("cli", CHECK_STATUS, json!({ "run_id": run_id })))
        .await;
    print_result(&status)
}

async fn parallel(
    hub: &Switchboard,
    tasks: Vec<(String, String)>,
    max_concurrency: Option<usize>,
    timeout_secs: Option<u64>,
    fail_fast: bool,
) -> anyhow::Result<()> {
    let tasks = tasks
        .into_iter()
        .map(|(agent, task)| ParallelTask::new(agent, task))
        .collect();
    let mut group = ParallelTaskGroup::new(CLI_SESSION, tasks).with_fail_fast(fail_fast);
    if let Some(max) = max_concurrency {
        group = group.with_max_concurrency(max);
    }
    if let Some(secs) = timeout_secs {
        group = group.with_timeout(Duration::from_secs(secs));
    }

    let progress: switchboard_orchestrator::ProgressCallback =
        std::sync::Arc::new(|p: GroupProgress| {
            eprintln!(
                "[{}/{}] {} finished ({} failed so far)",
                p.completed + p.failed,
                p.total,
                p.agent_name,
                p.failed
            );
        });
    let result = hub.orchestrator().execute_parallel(group, Some(progress)).await;
    println!("{}", aggregate_results(&result));
    if result.errors.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("Group {} finished with status {}", result.group_id, result.status)
    }
}

fn print_result(result: &ToolResult) -> anyhow::Result<()> {
    if result.is_error {
        anyhow::bail!("{}", result.content);
    }
    match result.payload() {
        Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        None => println!("{}", result.content),
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assignment() {
        assert_eq!(
            parse_assignment("coder=write tests = now").unwrap(),
            ("coder".to_string(), "write tests = now".to_string())
        );
        assert!(parse_assignment("coder").is_err());
        assert!(parse_assignment("=task").is_err());
        assert!(parse_assignment("coder=  ").is_err());
    }

    #[test]
    fn test_parallel_command_parses() {
        let cli = Cli::try_parse_from([
            "switchboard",
            "--config",
            "agents.toml",
            "parallel",
            "--task",
            "coder=fix bug",
            "--task",
            "writer=update docs",
            "--max-concurrency",
            "1",
            "--fail-fast",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("agents.toml"));
        match cli.command {
            Commands::Parallel {
                tasks,
                max_concurrency,
                fail_fast,
                timeout_secs,
            } => {
                assert_eq!(tasks.len(), 2);
                assert_eq!(tasks[1].0, "writer");
                assert_eq!(max_concurrency, Some(1));
                assert!(fail_fast);
                assert_eq!(timeout_secs, None);
            }
            _ => panic!("expected parallel command"),
        }
    }

    #[test]
    fn test_parallel_requires_a_task() {
        assert!(Cli::try_parse_from(["switchboard", "parallel"]).is_err());
    }

    #[test]
    fn test_delegate_defaults() {
        let cli = Cli::try_parse_from(["switchboard", "delegate", "-a", "coder", "-t", "refactor"])
            .unwrap();
        assert_eq!(cli.config, PathBuf::from("switchboard.toml"));
        match cli.command {
            Commands::Delegate { agent, no_wait, context, .. } => {
                assert_eq!(agent, "coder");
                assert!(!no_wait);
                assert!(context.is_none());
            }
            _ => panic!("expected delegate command"),
        }
    }
}
