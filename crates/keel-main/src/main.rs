use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use keel_agent_core::{Decision, ExecutionLoop, RunResult};
use keel_ai::{Message, ModelInvokerRef, OpenAiCompatInvoker};
use serde_json::{Value, json};

mod config;
mod config_cmd;
mod keel_home;
mod logging;

#[derive(Parser, Debug)]
#[command(name = "keel", version, about = "keel agent runner")]
struct Cli {
    #[arg(long, global = true)]
    conf_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: RootCommand,
}

#[derive(Subcommand, Debug, Clone)]
enum RootCommand {
    /// Append a human message to a thread and run the agent.
    Run(RunArgs),
    /// Answer a suspended tool review with a JSON array of decisions.
    Resume(ResumeArgs),
    /// Re-execute tool calls left unanswered by an interrupted process.
    Recover(ThreadArg),
    Threads(ThreadsArgs),
    Config(ConfigArgs),
}

#[derive(Args, Debug, Clone)]
struct RunArgs {
    #[arg(long)]
    thread: String,
    #[arg(required = true, num_args = 1..)]
    message: Vec<String>,
}

#[derive(Args, Debug, Clone)]
struct ResumeArgs {
    #[arg(long)]
    thread: String,
    /// e.g. `[{"type":"approve"},{"type":"reject","reason":"no"}]`
    #[arg(long)]
    decisions: String,
}

#[derive(Args, Debug, Clone)]
struct ThreadArg {
    #[arg(long)]
    thread: String,
}

#[derive(Args, Debug, Clone)]
struct ThreadsArgs {
    #[command(subcommand)]
    command: ThreadsSubcommand,
}

#[derive(Subcommand, Debug, Clone)]
enum ThreadsSubcommand {
    List,
    Show {
        thread: String,
    },
    History {
        thread: String,
        #[arg(long)]
        limit: Option<usize>,
    },
    Delete {
        thread: String,
    },
}

#[derive(Args, Debug, Clone)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigSubcommand,
}

#[derive(Subcommand, Debug, Clone)]
enum ConfigSubcommand {
    Init,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let conf_dir = cli.conf_dir.clone();
    let result = match cli.command {
        RootCommand::Config(args) => match args.command {
            ConfigSubcommand::Init => config_cmd::run_config_init(conf_dir),
        },
        command => run_agent_command(command, conf_dir).await,
    };

    if let Err(error) = result {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

async fn run_agent_command(command: RootCommand, conf_dir: Option<PathBuf>) -> Result<(), String> {
    let keel_home_dir = keel_home::resolve_keel_home_dir(conf_dir.as_deref());
    let config_path = keel_home::keel_config_path(&keel_home_dir);
    let config = config::load_keel_config(&config_path, &keel_home_dir)?;
    logging::init_tracing(&config.log);

    let invoker: ModelInvokerRef = Arc::new(OpenAiCompatInvoker::new(config.model.clone()));
    let engine =
        config::build_execution_loop(&config, invoker, None).map_err(|error| error.to_string())?;

    match command {
        RootCommand::Run(args) => {
            let input = vec![Message::human(args.message.join(" "))];
            let result = engine
                .run(&args.thread, input, Value::Null)
                .await
                .map_err(|error| error.to_string())?;
            print_run_result(&result)
        }
        RootCommand::Resume(args) => {
            let decisions = serde_json::from_str::<Vec<Decision>>(&args.decisions)
                .map_err(|error| format!("invalid --decisions: {error}"))?;
            let result = engine
                .resume(&args.thread, decisions, Value::Null)
                .await
                .map_err(|error| error.to_string())?;
            print_run_result(&result)
        }
        RootCommand::Recover(args) => {
            let result = engine
                .recover(&args.thread, Value::Null)
                .await
                .map_err(|error| error.to_string())?;
            print_run_result(&result)
        }
        RootCommand::Threads(args) => run_threads_command(&engine, args.command).await,
        RootCommand::Config(_) => Ok(()),
    }
}

async fn run_threads_command(
    engine: &ExecutionLoop,
    command: ThreadsSubcommand,
) -> Result<(), String> {
    match command {
        ThreadsSubcommand::List => {
            let threads = engine
                .list_threads()
                .await
                .map_err(|error| error.to_string())?;
            for thread in threads {
                println!(
                    "{}\tv{}\t{} messages{}",
                    thread.thread_id,
                    thread.version,
                    thread.message_count,
                    if thread.pending { "\tpending" } else { "" }
                );
            }
            Ok(())
        }
        ThreadsSubcommand::Show { thread } => {
            let checkpoint = engine
                .state(&thread)
                .await
                .map_err(|error| error.to_string())?
                .ok_or_else(|| format!("thread '{thread}' not found"))?;
            print_json(&checkpoint)
        }
        ThreadsSubcommand::History { thread, limit } => {
            let history = engine
                .history(&thread, limit)
                .await
                .map_err(|error| error.to_string())?;
            let summary = history
                .iter()
                .map(|checkpoint| {
                    json!({
                        "version": checkpoint.version,
                        "messages": checkpoint.state.messages.len(),
                        "pending": checkpoint.state.pending.is_some(),
                    })
                })
                .collect::<Vec<_>>();
            print_json(&summary)
        }
        ThreadsSubcommand::Delete { thread } => {
            let deleted = engine
                .delete_thread(&thread)
                .await
                .map_err(|error| error.to_string())?;
            if deleted {
                println!("deleted: {thread}");
                Ok(())
            } else {
                Err(format!("thread '{thread}' not found"))
            }
        }
    }
}

fn print_run_result(result: &RunResult) -> Result<(), String> {
    if let Some(interrupt) = &result.interrupt {
        println!("interrupted: {} (v{})", result.thread_id, result.version);
        return print_json(&interrupt.action_requests);
    }
    if let Some(structured) = &result.structured_response {
        return print_json(structured);
    }
    match result.last_message() {
        Some(message @ Message::Ai { .. }) => println!("{}", message.content()),
        Some(message) => println!("[{}] {}", message_role(message), message.content()),
        None => {}
    }
    Ok(())
}

fn message_role(message: &Message) -> &'static str {
    match message {
        Message::System { .. } => "system",
        Message::Human { .. } => "human",
        Message::Ai { .. } => "ai",
        Message::Tool { .. } => "tool",
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|error| format!("serialize output failed: {error}"))?;
    println!("{text}");
    Ok(())
}
