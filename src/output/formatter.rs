//! Output formatting

use serde_json::Value;

use crate::output::human::format_human;
use crate::output::json::format_json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    Json,
}

pub fn format_output(result: &Value, format: &OutputFormat) -> String {
    match format {
        OutputFormat::Human => format_human(result),
        OutputFormat::Json => format_json(result),
    }
}
