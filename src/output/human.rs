//! Human-readable output formatting

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

pub fn format_human(result: &Value) -> String {
    let Some(object) = result.as_object() else {
        return plain(result);
    };

    if let Some(error) = object.get("error") {
        return format!("Error: {}", plain(error));
    }
    if let Some(Value::Array(containers)) = object.get("containers") {
        return format_containers(object, containers);
    }
    if let Some(Value::Array(images)) = object.get("images") {
        return format_list("Images", images, "No images found");
    }
    if let Some(Value::Array(endpoints)) = object.get("endpoints") {
        return format_list("Endpoints", endpoints, "Docker is not connected");
    }
    format_fields(object)
}

fn format_fields(object: &Map<String, Value>) -> String {
    let width = object.keys().map(|k| k.len()).max().unwrap_or(0) + 1;
    let mut output = String::new();
    for (key, value) in object {
        let rendered = match key.as_str() {
            "expires" | "created" => timestamp(value),
            _ => plain(value),
        };
        output.push_str(&format!("{:<width$} {}\n", format!("{}:", title(key)), rendered));
    }
    output.trim_end().to_string()
}

fn format_list(heading: &str, items: &[Value], empty: &str) -> String {
    if items.is_empty() {
        return empty.to_string();
    }
    let mut output = format!("{}\n{}\n", heading, "-".repeat(heading.len()));
    for item in items {
        output.push_str(&format!("  {}\n", plain(item)));
    }
    output
}

fn format_containers(object: &Map<String, Value>, containers: &[Value]) -> String {
    let connected = object.get("connected").and_then(Value::as_bool).unwrap_or(false);
    let mut output = format!(
        "Running Containers ({})\n{}\n",
        if connected { "connected" } else { "disconnected" },
        "-".repeat(32)
    );
    if containers.is_empty() {
        output.push_str("No containers tracked\n");
        return output;
    }

    output.push_str(&format!(
        "{:<14} {:<20} {:<12} {:<10} {:>6} {:<20} {:>7}\n",
        "ID", "CHALLENGE", "OWNER", "ENDPOINT", "PORT", "EXPIRES", "RUNNING"
    ));
    output.push_str(&"-".repeat(95));
    output.push('\n');
    for container in containers {
        let owner = container
            .get("team")
            .filter(|t| !t.is_null())
            .or_else(|| container.get("user"))
            .map(plain)
            .unwrap_or_default();
        output.push_str(&format!(
            "{:<14} {:<20} {:<12} {:<10} {:>6} {:<20} {:>7}\n",
            truncate(&field(container, "container_id"), 14),
            truncate(&field(container, "challenge"), 20),
            truncate(&owner, 12),
            truncate(&field(container, "endpoint"), 10),
            field(container, "port"),
            container.get("expires").map(timestamp).unwrap_or_default(),
            if container.get("is_running").and_then(Value::as_bool) == Some(true) {
                "yes"
            } else {
                "no"
            }
        ));
    }
    output
}

fn field(value: &Value, key: &str) -> String {
    value.get(key).map(plain).unwrap_or_default()
}

fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "-".to_string(),
        other => other.to_string(),
    }
}

fn timestamp(value: &Value) -> String {
    value
        .as_i64()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| plain(value))
}

fn title(key: &str) -> String {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_line() {
        assert_eq!(
            format_human(&json!({ "error": "No container found" })),
            "Error: No container found"
        );
    }

    #[test]
    fn test_fields_render_timestamps() {
        let out = format_human(&json!({ "status": "created", "port": 9001, "expires": 0 }));
        assert!(out.contains("Status:"));
        assert!(out.contains("1970-01-01 00:00:00"));
        assert!(out.contains("9001"));
    }

    #[test]
    fn test_container_table() {
        let out = format_human(&json!({
            "connected": true,
            "teams": [],
            "challenges": [],
            "containers": [{
                "container_id": "main-000001",
                "challenge": "pwn [1]",
                "user": "user [7]",
                "endpoint": "main",
                "port": 9001,
                "expires": 60,
                "is_running": true
            }]
        }));
        assert!(out.contains("connected"));
        assert!(out.contains("main-000001"));
        assert!(out.contains("user [7]"));
    }

    #[test]
    fn test_empty_lists() {
        assert_eq!(format_human(&json!({ "images": [] })), "No images found");
        assert_eq!(format_human(&json!({ "endpoints": [] })), "Docker is not connected");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abcdefghij", 6), "abc...");
        assert_eq!(truncate("abc", 6), "abc");
    }
}
