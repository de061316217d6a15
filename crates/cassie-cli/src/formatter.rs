//! Output formatters for statement results.

use cassie_client::ExecutionResult;
use cassie_proto::{QueryResult, Rows, Value};
use clap::ValueEnum;
use comfy_table::{Cell, Table};

/// Output format for results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format
    Table,
    /// JSON format
    Json,
    /// CSV format
    Csv,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Csv => write!(f, "csv"),
        }
    }
}

/// Trait for formatting output.
pub trait Formatter: Send + Sync {
    /// Format the result of one statement.
    fn format_result(&self, result: &ExecutionResult) -> String {
        match &result.result {
            QueryResult::Rows(rows) => self.format_rows(rows),
            QueryResult::Void => String::new(),
            QueryResult::SetKeyspace(keyspace) => {
                self.format_message(&format!("Now using keyspace {}", keyspace))
            }
            QueryResult::Prepared(prepared) => {
                self.format_message(&format!("Prepared ({} bind markers)", prepared.bind.columns.len()))
            }
            QueryResult::SchemaChange(change) => {
                let object = match &change.name {
                    Some(name) => format!("{}.{}", change.keyspace, name),
                    None => change.keyspace.clone(),
                };
                self.format_message(&format!("{} {} {}", change.change, change.target, object))
            }
        }
    }

    /// Format one page of rows.
    fn format_rows(&self, rows: &Rows) -> String;

    /// Format an error message.
    fn format_error(&self, error: &str) -> String;

    /// Format a simple message.
    fn format_message(&self, message: &str) -> String;
}

/// Create a formatter for the given output format.
pub fn create_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Table => Box::new(TableFormatter),
        OutputFormat::Json => Box::new(JsonFormatter),
        OutputFormat::Csv => Box::new(CsvFormatter),
    }
}

/// Table formatter using comfy-table.
pub struct TableFormatter;

impl Formatter for TableFormatter {
    fn format_rows(&self, rows: &Rows) -> String {
        let mut table = Table::new();
        table.set_header(rows.columns().iter().map(|c| Cell::new(&c.name)));

        for row in rows.iter() {
            table.add_row(row.values().iter().map(|v| Cell::new(format_value(v))));
        }

        let mut output = format!("{}\n{} row(s)", table, rows.len());
        if rows.has_more_pages() {
            output.push_str(" (more pages available)");
        }
        output
    }

    fn format_error(&self, error: &str) -> String {
        format!("Error: {}", error)
    }

    fn format_message(&self, message: &str) -> String {
        message.to_string()
    }
}

/// JSON formatter.
pub struct JsonFormatter;

impl Formatter for JsonFormatter {
    fn format_rows(&self, rows: &Rows) -> String {
        let array: Vec<serde_json::Value> = rows
            .iter()
            .map(|row| {
                let mut obj = serde_json::Map::new();
                for (column, value) in row.columns().iter().zip(row.values()) {
                    obj.insert(column.name.clone(), value_to_json(value));
                }
                serde_json::Value::Object(obj)
            })
            .collect();
        serde_json::to_string_pretty(&array).unwrap_or_else(|_| "[]".to_string())
    }

    fn format_error(&self, error: &str) -> String {
        serde_json::json!({
            "error": error
        })
        .to_string()
    }

    fn format_message(&self, message: &str) -> String {
        serde_json::json!({
            "message": message
        })
        .to_string()
    }
}

/// CSV formatter.
pub struct CsvFormatter;

impl Formatter for CsvFormatter {
    fn format_rows(&self, rows: &Rows) -> String {
        let mut output = String::new();

        let headers: Vec<String> = rows.columns().iter().map(|c| escape_csv(&c.name)).collect();
        output.push_str(&headers.join(","));
        output.push('\n');

        for row in rows.iter() {
            let cells: Vec<String> = row.values().iter().map(format_value_csv).collect();
            output.push_str(&cells.join(","));
            output.push('\n');
        }

        output
    }

    fn format_error(&self, error: &str) -> String {
        format!("error\n{}", escape_csv(error))
    }

    fn format_message(&self, message: &str) -> String {
        message.to_string()
    }
}

/// Format a Value as a display string.
fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Ascii(s) | Value::Text(s) => s.clone(),
        Value::Inet(ip) => ip.to_string(),
        other => other.to_string(),
    }
}

/// Format a Value for CSV output. Nulls become empty cells.
fn format_value_csv(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        other => escape_csv(&format_value(other)),
    }
}

/// Convert a Value to JSON.
fn value_to_json(value: &Value) -> serde_json::Value {
    use serde_json::Value as Json;

    match value {
        Value::Null => Json::Null,
        Value::Boolean(b) => Json::Bool(*b),
        Value::TinyInt(i) => Json::Number((*i).into()),
        Value::SmallInt(i) => Json::Number((*i).into()),
        Value::Int(i) => Json::Number((*i).into()),
        Value::BigInt(i) | Value::Counter(i) | Value::Timestamp(i) => Json::Number((*i).into()),
        Value::Float(f) => serde_json::Number::from_f64(f64::from(*f))
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Value::Double(f) => serde_json::Number::from_f64(*f)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Value::Date(d) => Json::Number(d.unix_days().into()),
        Value::Time(t) => Json::Number(t.nanos().into()),
        Value::Ascii(s) | Value::Text(s) => Json::String(s.clone()),
        Value::List(items) | Value::Set(items) | Value::Tuple(items) => {
            Json::Array(items.iter().map(value_to_json).collect())
        }
        Value::Map(entries) => {
            if entries.iter().all(|(k, _)| k.as_str().is_some()) {
                Json::Object(
                    entries
                        .iter()
                        .map(|(k, v)| (format_value(k), value_to_json(v)))
                        .collect(),
                )
            } else {
                Json::Array(
                    entries
                        .iter()
                        .map(|(k, v)| Json::Array(vec![value_to_json(k), value_to_json(v)]))
                        .collect(),
                )
            }
        }
        Value::Udt(fields) => Json::Object(
            fields
                .iter()
                .map(|(name, v)| (name.clone(), value_to_json(v)))
                .collect(),
        ),
        // Varint, decimal, blob, uuid and inet keep their textual form.
        other => Json::String(format_value(other)),
    }
}

/// Escape a string for CSV, quoting it when needed.
fn escape_csv(s: &str) -> String {
    if s.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
