//! Statement execution and script splitting.

use crate::formatter::Formatter;
use cassie_client::{ExecutionOptions, Session};
use thiserror::Error;

/// Execution errors.
#[derive(Debug, Error)]
pub enum ExecuteError {
    /// Client or server error.
    #[error("{0}")]
    Client(#[from] cassie_client::Error),

    /// Could not read a script file.
    #[error("could not read {path}: {source}")]
    Script {
        path: String,
        source: std::io::Error,
    },
}

/// Execute one statement and return formatted output.
///
/// With `all_pages`, every remaining page is fetched and formatted in turn.
pub async fn execute(
    session: &Session,
    statement: &str,
    options: &ExecutionOptions,
    all_pages: bool,
    formatter: &dyn Formatter,
) -> Result<String, ExecuteError> {
    let mut result = session.execute_with(statement, options).await?;
    tracing::debug!(host = %result.host, attempts = result.attempts, "statement executed");

    let mut output = Vec::new();
    for warning in &result.warnings {
        output.push(formatter.format_message(&format!("Warning: {}", warning)));
    }
    if let Some(id) = result.tracing_id {
        output.push(formatter.format_message(&format!("Tracing session: {}", id)));
    }
    output.push(formatter.format_result(&result));

    while all_pages {
        match session.next_page(statement, options, &result).await? {
            Some(next) => {
                output.push(formatter.format_result(&next));
                result = next;
            }
            None => break,
        }
    }

    output.retain(|s| !s.is_empty());
    Ok(output.join("\n"))
}

/// Read a script file and split it into statements.
pub fn read_script(path: &std::path::Path) -> Result<Vec<String>, ExecuteError> {
    let content = std::fs::read_to_string(path).map_err(|source| ExecuteError::Script {
        path: path.display().to_string(),
        source,
    })?;
    Ok(split_statements(&content))
}

/// Split a script into statements on `;`.
///
/// Semicolons inside string literals, quoted identifiers and comments do not
/// end a statement. `--` and `//` line comments and `/* */` block comments
/// are dropped.
pub fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut chars = script.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                current.push(c);
                while let Some(inner) = chars.next() {
                    current.push(inner);
                    if inner == c {
                        // Doubled quote escapes itself.
                        if chars.peek() == Some(&c) {
                            if let Some(escaped) = chars.next() {
                                current.push(escaped);
                            }
                            continue;
                        }
                        break;
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => skip_line(&mut chars),
            '/' if chars.peek() == Some(&'/') => skip_line(&mut chars),
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for inner in chars.by_ref() {
                    if prev == '*' && inner == '/' {
                        break;
                    }
                    prev = inner;
                }
                current.push(' ');
            }
            ';' => push_statement(&mut statements, &mut current),
            _ => current.push(c),
        }
    }
    push_statement(&mut statements, &mut current);
    statements
}

fn skip_line(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) {
    for c in chars.by_ref() {
        if c == '\n' {
            break;
        }
    }
}

fn push_statement(statements: &mut Vec<String>, current: &mut String) {
    let statement = current.trim();
    if !statement.is_empty() {
        statements.push(statement.to_string());
    }
    current.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_simple() {
        let statements = split_statements("SELECT * FROM a; SELECT * FROM b;");
        assert_eq!(statements, vec!["SELECT * FROM a", "SELECT * FROM b"]);
    }

    #[test]
    fn test_split_trailing_statement_without_semicolon() {
        let statements = split_statements("USE ks;\nSELECT * FROM t");
        assert_eq!(statements, vec!["USE ks", "SELECT * FROM t"]);
    }

    #[test]
    fn test_split_ignores_semicolons_in_strings() {
        let statements =
            split_statements("INSERT INTO t (k, v) VALUES (1, 'a;b''c');\nSELECT \"we;ird\" FROM t;");
        assert_eq!(
            statements,
            vec!["INSERT INTO t (k, v) VALUES (1, 'a;b''c')", "SELECT \"we;ird\" FROM t"]
        );
    }

    #[test]
    fn test_split_drops_comments() {
        let script = "-- setup; not a statement\nUSE ks; // trailing; comment\n/* block; */ SELECT 1 FROM t;";
        let statements = split_statements(script);
        assert_eq!(statements, vec!["USE ks", "SELECT 1 FROM t"]);
    }

    #[test]
    fn test_read_missing_script() {
        let err = read_script(std::path::Path::new("/nonexistent/script.cql")).unwrap_err();
        assert!(matches!(err, ExecuteError::Script { .. }));
        assert!(err.to_string().starts_with("could not read /nonexistent/script.cql"));
    }

    #[test]
    fn test_split_empty() {
        assert!(split_statements("  ;\n; -- nothing\n").is_empty());
    }
}
