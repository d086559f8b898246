//! Current time tool.

use agentrelay_core::error::ToolError;
use agentrelay_core::tool::{Tool, ToolResult};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};

pub struct CurrentTimeTool;

/// Parse `+07:00`, `-0530`, `Z` or `UTC` into a fixed offset.
fn parse_offset(raw: &str) -> Result<FixedOffset, ToolError> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("utc") || raw == "Z" {
        return FixedOffset::east_opt(0).ok_or_else(|| ToolError::InvalidArguments("bad offset".into()));
    }

    let invalid = || ToolError::InvalidArguments(format!("Invalid utc_offset '{raw}', expected e.g. +07:00"));
    let (sign, rest) = match raw.as_bytes().first() {
        Some(b'+') => (1, &raw[1..]),
        Some(b'-') => (-1, &raw[1..]),
        _ => return Err(invalid()),
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let hours: i32 = digits[..2].parse().map_err(|_| invalid())?;
    let minutes: i32 = digits[2..].parse().map_err(|_| invalid())?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

fn describe(now: DateTime<Utc>, offset: FixedOffset, format: &str) -> serde_json::Value {
    let local = now.with_timezone(&offset);
    let formatted = match format {
        "human" => local.format("%A, %B %-d, %Y %H:%M:%S").to_string(),
        "unix" => now.timestamp().to_string(),
        _ => local.to_rfc3339(),
    };
    serde_json::json!({
        "current_time": formatted,
        "utc_offset": offset.to_string(),
        "unix_timestamp": now.timestamp(),
        "day_of_week": local.format("%A").to_string(),
        "month": local.format("%B").to_string(),
    })
}

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Gets the current date and time. Useful for time-sensitive information or scheduling."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "utc_offset": {
                    "type": "string",
                    "description": "Offset from UTC such as +07:00 (default: UTC)"
                },
                "format": {
                    "type": "string",
                    "enum": ["iso", "human", "unix"],
                    "description": "Output format (default: iso)"
                }
            }
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let offset = parse_offset(arguments["utc_offset"].as_str().unwrap_or("UTC"))?;
        let format = arguments["format"].as_str().unwrap_or("iso");
        Ok(ToolResult::ok(describe(Utc::now(), offset, format)))
    }
}
