//! Interactive REPL loop: read stdin, send each line as a message, print the
//! reply, repeat until EOF or a quit command.

use std::io::Write;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};

use cli::{RunBackend, RunOptions, RunOutput};

/// Runs the REPL loop against a single (possibly freshly created) workspace.
///
/// Exits on EOF (Ctrl+D), empty line, or `quit`/`exit`/`/quit`. On error,
/// prints to stderr and continues.
pub async fn run_repl_loop(
    backend: &Arc<dyn RunBackend>,
    mut opts: RunOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut reader = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let line = match reader.next_line().await? {
            None => break,
            Some(s) if s.trim().is_empty() => continue,
            Some(s) if is_quit_command(&s) => break,
            Some(s) => s,
        };

        opts.message = line;
        match backend.run(&opts, None).await {
            Ok(RunOutput::Reply { workspace_id, reply }) => {
                opts.workspace_id = Some(workspace_id);
                println!("{}", reply);
            }
            Ok(RunOutput::Json { workspace_id, events }) => {
                opts.workspace_id = Some(workspace_id);
                println!("{}", serde_json::to_string(&serde_json::json!({ "events": events }))?);
            }
            Err(e) => eprintln!("error: {}", e),
        }
    }

    println!("Bye.");
    Ok(())
}

fn is_quit_command(s: &str) -> bool {
    let lower = s.trim().to_lowercase();
    matches!(lower.as_str(), "quit" | "exit" | "/quit")
}
