//! Interactive REPL implementation.

use crate::commands::{self, CommandResult};
use crate::completer::CqlHelper;
use crate::executor;
use crate::formatter::{self, OutputFormat};
use cassie_client::{ExecutionOptions, Session};
use rustyline::error::ReadlineError;
use rustyline::history::{DefaultHistory, History};
use rustyline::{Config, Editor};
use std::path::PathBuf;

/// Get the history file path.
fn history_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cassie_history")
}

/// Run the interactive REPL.
///
/// Input is buffered until a line ends with `;`, so statements may span
/// several lines. Dot-commands are handled immediately.
pub async fn run(
    session: Session,
    mut options: ExecutionOptions,
    initial_format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut format = initial_format;

    let rl_config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .build();

    let mut rl: Editor<CqlHelper, DefaultHistory> = Editor::with_config(rl_config)?;
    rl.set_helper(Some(CqlHelper));

    let hist_path = history_path();
    if hist_path.exists() {
        let _ = rl.load_history(&hist_path);
    }

    println!(
        "Connected to {} (protocol {})",
        session
            .pool()
            .hosts()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", "),
        session.protocol_version()
    );
    println!("Type .help for commands, .exit to quit\n");

    let mut buffer = String::new();
    loop {
        let prompt = match (buffer.is_empty(), session.keyspace()) {
            (false, _) => "   ...> ".to_string(),
            (true, Some(keyspace)) => format!("cassie:{}> ", keyspace),
            (true, None) => "cassie> ".to_string(),
        };

        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();

                if line.is_empty() {
                    continue;
                }

                if buffer.is_empty() && commands::is_command(line) {
                    match commands::handle_command(line, Some(&session), format) {
                        CommandResult::Exit => {
                            println!("Goodbye!");
                            break;
                        }
                        CommandResult::Output(msg) => println!("{}", msg),
                        CommandResult::SetFormat(fmt) => {
                            format = fmt;
                            println!("Output format set to {}", format);
                        }
                        CommandResult::SetConsistency(consistency) => {
                            options = options.with_consistency(consistency);
                            println!("Consistency level set to {}", consistency);
                        }
                        CommandResult::SetPageSize(size) => {
                            options = options.with_page_size(size);
                            match size {
                                Some(size) => println!("Page size set to {}", size),
                                None => println!("Paging disabled"),
                            }
                        }
                        CommandResult::SetTracing(enabled) => {
                            options = options.with_tracing(enabled);
                            println!("Tracing {}", if enabled { "on" } else { "off" });
                        }
                        CommandResult::ShowHistory => {
                            let history = rl.history();
                            let len = history.len();
                            let start = len.saturating_sub(20);
                            for (i, entry) in history.iter().skip(start).enumerate() {
                                println!("{:4}  {}", start + i + 1, entry);
                            }
                        }
                        CommandResult::Clear => {
                            // ANSI clear screen
                            print!("\x1B[2J\x1B[1;1H");
                        }
                    }
                    continue;
                }

                if !buffer.is_empty() {
                    buffer.push('\n');
                }
                buffer.push_str(line);
                if !line.ends_with(';') {
                    continue;
                }

                let formatter = formatter::create_formatter(format);
                for statement in executor::split_statements(&buffer) {
                    match executor::execute(&session, &statement, &options, false, &*formatter).await
                    {
                        Ok(output) => {
                            if !output.is_empty() {
                                println!("{}", output);
                            }
                        }
                        Err(e) => println!("{}", formatter.format_error(&e.to_string())),
                    }
                }
                buffer.clear();
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                buffer.clear();
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("Goodbye!");
                break;
            }
            Err(err) => {
                println!("Error: {:?}", err);
                break;
            }
        }
    }

    let _ = rl.save_history(&hist_path);
    session.close().await;

    Ok(())
}
