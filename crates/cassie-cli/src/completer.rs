//! Tab completion for the REPL.

use rustyline::completion::{Completer, Pair};
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::validate::Validator;
use rustyline::{Context, Helper};
use std::borrow::Cow;

/// REPL helper completing dot-commands and CQL keywords.
#[derive(Default)]
pub struct CqlHelper;

/// Dot-commands for completion.
const DOT_COMMANDS: &[&str] = &[
    ".status",
    ".consistency",
    ".paging",
    ".tracing",
    ".format",
    ".history",
    ".clear",
    ".help",
    ".exit",
    ".quit",
];

const CQL_KEYWORDS: &[&str] = &[
    "SELECT", "FROM", "WHERE", "AND", "INSERT", "INTO", "VALUES", "UPDATE", "SET", "DELETE",
    "BEGIN", "BATCH", "APPLY", "UNLOGGED", "COUNTER", "USE", "CREATE", "ALTER", "DROP",
    "TRUNCATE", "KEYSPACE", "TABLE", "TYPE", "INDEX", "IF", "EXISTS", "NOT", "LIMIT", "ORDER",
    "BY", "ASC", "DESC", "USING", "TTL", "TIMESTAMP", "IN", "ALLOW", "FILTERING", "PRIMARY",
    "KEY", "WITH",
];

const CONSISTENCY_LEVELS: &[&str] = &[
    "ANY",
    "ONE",
    "TWO",
    "THREE",
    "QUORUM",
    "ALL",
    "LOCAL_QUORUM",
    "EACH_QUORUM",
    "SERIAL",
    "LOCAL_SERIAL",
    "LOCAL_ONE",
];

fn matching(candidates: &[&str], word: &str) -> Vec<Pair> {
    let upper = word.to_uppercase();
    candidates
        .iter()
        .filter(|c| c.to_uppercase().starts_with(&upper))
        .map(|c| {
            // Keep the case the user is typing in.
            let replacement = if word.chars().any(char::is_lowercase) {
                c.to_lowercase()
            } else {
                c.to_string()
            };
            Pair {
                display: c.to_string(),
                replacement,
            }
        })
        .collect()
}

impl Completer for CqlHelper {
    type Candidate = Pair;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<Pair>)> {
        let line_to_cursor = &line[..pos];
        let trimmed = line_to_cursor.trim_start();

        // Dot commands at start of line
        if trimmed.starts_with('.') && !trimmed.contains(' ') {
            let start = pos - trimmed.len();
            let completions = DOT_COMMANDS
                .iter()
                .filter(|cmd| cmd.starts_with(trimmed))
                .map(|cmd| Pair {
                    display: cmd.to_string(),
                    replacement: cmd.to_string(),
                })
                .collect();
            return Ok((start, completions));
        }

        let word_start = line_to_cursor
            .rfind(|c: char| c.is_whitespace() || c == '(' || c == ',')
            .map(|i| i + 1)
            .unwrap_or(0);
        let word = &line_to_cursor[word_start..];

        if trimmed.starts_with(".consistency ") {
            return Ok((word_start, matching(CONSISTENCY_LEVELS, word)));
        }
        if word.is_empty() || trimmed.starts_with('.') {
            return Ok((pos, Vec::new()));
        }

        Ok((word_start, matching(CQL_KEYWORDS, word)))
    }
}

impl Hinter for CqlHelper {
    type Hint = String;

    fn hint(&self, _line: &str, _pos: usize, _ctx: &Context<'_>) -> Option<String> {
        None
    }
}

impl Highlighter for CqlHelper {
    fn highlight<'l>(&self, line: &'l str, _pos: usize) -> Cow<'l, str> {
        Cow::Borrowed(line)
    }

    fn highlight_char(&self, _line: &str, _pos: usize, _kind: rustyline::highlight::CmdKind) -> bool {
        false
    }
}

impl Validator for CqlHelper {}

impl Helper for CqlHelper {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matching_keeps_typed_case() {
        let upper: Vec<String> = matching(CQL_KEYWORDS, "SEL")
            .into_iter()
            .map(|p| p.replacement)
            .collect();
        assert_eq!(upper, vec!["SELECT"]);

        let lower: Vec<String> = matching(CQL_KEYWORDS, "sel")
            .into_iter()
            .map(|p| p.replacement)
            .collect();
        assert_eq!(lower, vec!["select"]);
    }

    #[test]
    fn test_matching_consistency_levels() {
        let found: Vec<String> = matching(CONSISTENCY_LEVELS, "local_")
            .into_iter()
            .map(|p| p.display)
            .collect();
        assert_eq!(found, vec!["LOCAL_QUORUM", "LOCAL_SERIAL", "LOCAL_ONE"]);
    }
}
