//! `loom`: a thin operator CLI over the same engine `serve` exposes — run a
//! message, tail a workspace's history, inspect queued/running tasks, list
//! MCP tools. Everything but `serve` runs in-process; there is no remote mode.

mod log_format;
mod logging;
mod repl;

use clap::{Parser, Subcommand};
use cli::engine::build_engine;
use cli::{LocalBackend, RunBackend, RunOptions, RunOutput, StreamOut, ToolShowFormat};
use repl::run_repl_loop;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "loom")]
#[command(about = "Operator CLI for the loom agent engine")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Run the HTTP/WebSocket server.
    Serve(ServeArgs),
    /// Send one message to a workspace (creating one if `--workspace` is absent).
    Run(RunArgs),
    /// Start an interactive REPL against a workspace.
    Repl(RunArgs),
    /// List or inspect MCP tool definitions.
    Tool(ToolArgs),
    /// List queued/running tasks under a workspace.
    Task(TaskArgs),
    /// Print the tail of a workspace's message history.
    Tail(TailArgs),
}

#[derive(clap::Args, Debug, Clone)]
struct ServeArgs {
    /// Listen address (default 127.0.0.1:8080)
    #[arg(long, value_name = "ADDR")]
    addr: Option<String>,
    /// Keep running after the first connection (default: exit after it, used by tests)
    #[arg(long)]
    keep_alive: bool,
}

#[derive(clap::Args, Debug, Clone)]
struct RunArgs {
    /// Message text (or pass as trailing positional args)
    #[arg(short, long, value_name = "TEXT")]
    message: Option<String>,

    #[arg(trailing_var_arg = true)]
    rest: Vec<String>,

    /// Workspace to run in; a new one is created when absent
    #[arg(short = 'w', long, value_name = "ID")]
    workspace: Option<String>,

    /// Directory a freshly created workspace should be rooted at
    #[arg(short = 'C', long, value_name = "DIR")]
    working_folder: Option<PathBuf>,

    /// `@file` mention to attach (repeatable)
    #[arg(long = "file", value_name = "PATH")]
    file_mentions: Vec<String>,

    /// Stream raw events as JSON instead of printing plain text
    #[arg(long)]
    json: bool,
}

#[derive(clap::Args, Debug, Clone)]
struct ToolArgs {
    #[command(subcommand)]
    sub: ToolCommand,
}

#[derive(Subcommand, Debug, Clone)]
enum ToolCommand {
    /// List all tools visible to a workspace
    List {
        #[arg(short = 'w', long, value_name = "ID")]
        workspace: Option<String>,
    },
    /// Show the full definition of one tool
    Show {
        name: String,
        #[arg(short = 'w', long, value_name = "ID")]
        workspace: Option<String>,
        /// Output format: yaml (default) or json
        #[arg(long, value_name = "FORMAT", default_value = "yaml")]
        output: String,
    },
}

#[derive(clap::Args, Debug, Clone)]
struct TaskArgs {
    /// Parent workspace id
    workspace: String,
}

#[derive(clap::Args, Debug, Clone)]
struct TailArgs {
    /// Workspace id
    workspace: String,
    /// Only print the last N messages
    #[arg(short = 'n', long, value_name = "COUNT")]
    lines: Option<usize>,
}

/// Max reply length printed to stdout in plain-text mode; 0 means unlimited.
/// Read from `LOOM_MAX_REPLY_LEN`.
fn max_reply_len() -> usize {
    std::env::var("LOOM_MAX_REPLY_LEN").ok().and_then(|v| v.parse().ok()).unwrap_or(0)
}

/// Truncates `s` to at most `max` chars, appending `...` when truncated (total length = max).
/// Uses character boundaries for safe UTF-8 handling.
fn truncate_message(s: &str, max: usize) -> String {
    const SUFFIX: &str = "...";
    let suffix_len = 3;
    if max <= suffix_len {
        return s.chars().take(max).collect();
    }
    let content_max = max - suffix_len;
    if s.chars().count() <= max {
        return s.to_string();
    }
    format!("{}{}", s.chars().take(content_max).collect::<String>(), SUFFIX)
}

fn run_options_from(args: &RunArgs) -> Result<RunOptions, Box<dyn std::error::Error>> {
    let message = args.message.clone().or_else(|| {
        if args.rest.is_empty() {
            None
        } else {
            Some(args.rest.join(" "))
        }
    });
    let Some(message) = message else {
        return Err("provide a message via -m/--message or trailing positional args".into());
    };
    Ok(RunOptions {
        message,
        workspace_id: args.workspace.clone(),
        working_folder: args.working_folder.clone(),
        file_mentions: args.file_mentions.clone(),
        output_json: args.json,
    })
}

fn make_stream_out(json: bool) -> StreamOut {
    if !json {
        return None;
    }
    Some(Arc::new(std::sync::Mutex::new(move |value: serde_json::Value| {
        println!("{}", serde_json::to_string(&value).unwrap_or_default());
    })))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    config::load_and_apply("loom", None::<&std::path::Path>).ok();
    logging::init()?;

    let args = Args::parse();

    if let Command::Serve(sa) = &args.cmd {
        if let Err(e) = serve::run_serve(sa.addr.as_deref(), !sa.keep_alive).await {
            eprintln!("serve error: {}", e);
            std::process::exit(1);
        }
        return Ok(());
    }

    let engine = build_engine()?;
    let backend: Arc<dyn RunBackend> = Arc::new(LocalBackend::new(engine));

    match &args.cmd {
        Command::Serve(_) => unreachable!(),
        Command::Run(run_args) => {
            let opts = run_options_from(run_args)?;
            let stream_out = make_stream_out(run_args.json);
            match backend.run(&opts, stream_out).await {
                Ok(RunOutput::Reply { reply, .. }) => {
                    let len = max_reply_len();
                    println!("{}", if len == 0 { reply } else { truncate_message(&reply, len) });
                }
                Ok(RunOutput::Json { events, .. }) => {
                    println!("{}", serde_json::to_string(&serde_json::json!({ "events": events }))?);
                }
                Err(e) => {
                    eprintln!("error: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Command::Repl(run_args) => {
            let opts = RunOptions {
                message: String::new(),
                workspace_id: run_args.workspace.clone(),
                working_folder: run_args.working_folder.clone(),
                file_mentions: run_args.file_mentions.clone(),
                output_json: run_args.json,
            };
            run_repl_loop(&backend, opts).await?;
        }
        Command::Tool(ta) => match &ta.sub {
            ToolCommand::List { workspace } => {
                let opts = RunOptions { workspace_id: workspace.clone(), ..Default::default() };
                if let Err(e) = backend.list_tools(&opts).await {
                    eprintln!("{}", e);
                    std::process::exit(1);
                }
            }
            ToolCommand::Show { name, workspace, output } => {
                let opts = RunOptions { workspace_id: workspace.clone(), ..Default::default() };
                let format = if output.eq_ignore_ascii_case("json") { ToolShowFormat::Json } else { ToolShowFormat::Yaml };
                if let Err(e) = backend.show_tool(&opts, name, format).await {
                    eprintln!("{}", e);
                    std::process::exit(1);
                }
            }
        },
        Command::Task(ta) => {
            if let Err(e) = backend.list_tasks(&ta.workspace).await {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        }
        Command::Tail(ta) => {
            if let Err(e) = backend.tail(&ta.workspace, ta.lines).await {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        }
    }
    Ok(())
}
