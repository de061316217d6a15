//! REPL dot-command handling.

use crate::formatter::OutputFormat;
use cassie_client::Session;
use cassie_proto::Consistency;

/// Result of executing a command.
#[derive(Debug, PartialEq)]
pub enum CommandResult {
    /// Exit the REPL.
    Exit,
    /// Output to display.
    Output(String),
    /// Change the output format.
    SetFormat(OutputFormat),
    /// Change the consistency level.
    SetConsistency(Consistency),
    /// Change the page size; `None` disables paging.
    SetPageSize(Option<i32>),
    /// Turn request tracing on or off.
    SetTracing(bool),
    /// Show history.
    ShowHistory,
    /// Clear screen.
    Clear,
}

/// Parse and execute a dot-command.
pub fn handle_command(line: &str, session: Option<&Session>, format: OutputFormat) -> CommandResult {
    let line = line.trim();
    let (command, arg) = match line.split_once(char::is_whitespace) {
        Some((command, arg)) => (command.to_lowercase(), Some(arg.trim())),
        None => (line.to_lowercase(), None),
    };

    match command.as_str() {
        ".exit" | ".quit" | ".q" => CommandResult::Exit,

        ".help" | ".h" | ".?" => CommandResult::Output(get_help()),

        ".clear" | ".cls" => CommandResult::Clear,

        ".history" => CommandResult::ShowHistory,

        ".status" => match session {
            Some(session) => {
                let hosts: Vec<String> = session
                    .pool()
                    .hosts()
                    .iter()
                    .map(|h| h.to_string())
                    .collect();
                CommandResult::Output(format!(
                    "Connected to {} (protocol {}, {} connections, keyspace {})",
                    hosts.join(", "),
                    session.protocol_version(),
                    session.pool().connection_count(),
                    session.keyspace().as_deref().unwrap_or("<none>")
                ))
            }
            None => CommandResult::Output("Not connected".to_string()),
        },

        ".format" => match arg {
            Some(fmt) => match fmt.to_lowercase().as_str() {
                "table" => CommandResult::SetFormat(OutputFormat::Table),
                "json" => CommandResult::SetFormat(OutputFormat::Json),
                "csv" => CommandResult::SetFormat(OutputFormat::Csv),
                _ => CommandResult::Output(format!(
                    "Unknown format '{}'. Use: table, json, csv",
                    fmt
                )),
            },
            None => CommandResult::Output(format!("Current format: {}", format)),
        },

        ".consistency" => match arg {
            Some(level) => match level.parse::<Consistency>() {
                Ok(consistency) => CommandResult::SetConsistency(consistency),
                Err(e) => CommandResult::Output(e.to_string()),
            },
            None => CommandResult::Output("Usage: .consistency <level>".to_string()),
        },

        ".paging" => match arg.map(str::to_lowercase).as_deref() {
            Some("off") => CommandResult::SetPageSize(None),
            Some(size) => match size.parse::<i32>() {
                Ok(size) if size > 0 => CommandResult::SetPageSize(Some(size)),
                _ => CommandResult::Output("Usage: .paging <rows>|off".to_string()),
            },
            None => CommandResult::Output("Usage: .paging <rows>|off".to_string()),
        },

        ".tracing" => match arg.map(str::to_lowercase).as_deref() {
            Some("on") => CommandResult::SetTracing(true),
            Some("off") => CommandResult::SetTracing(false),
            _ => CommandResult::Output("Usage: .tracing on|off".to_string()),
        },

        _ => CommandResult::Output(format!("Unknown command: {}", command)),
    }
}

/// Check if a line is a dot-command.
pub fn is_command(line: &str) -> bool {
    line.trim().starts_with('.')
}

/// Get help text for REPL commands.
fn get_help() -> String {
    r#"REPL Commands
=============

.status               Show connected hosts, protocol version and keyspace
.consistency <level>  Set the consistency level (ONE, QUORUM, LOCAL_QUORUM, ...)
.paging <rows>|off    Set the page size, or fetch everything in one page
.tracing on|off       Request server-side tracing
.format [type]        Get or set output format (table, json, csv)
.history              Show statement history
.clear                Clear the screen
.help                 Show this help message
.exit / .quit         Exit the REPL

Statements
==========
Any other input is sent as a CQL statement. End statements with ';' to
enter several on one line.

Examples:
  USE app;
  SELECT id, name FROM users WHERE id = 42;
  INSERT INTO users (id, name) VALUES (43, 'ada');
"#
    .to_string()
}
