//! Extractive text summary: leading sentences up to a word budget.

use agentrelay_core::error::ToolError;
use agentrelay_core::tool::{Tool, ToolResult};
use async_trait::async_trait;

pub struct TextSummaryTool;

const DEFAULT_MAX_WORDS: usize = 100;

struct Summary {
    text: String,
    word_count: usize,
}

fn summarize(text: &str, max_words: usize) -> Summary {
    let mut summary = String::new();
    let mut word_count = 0;

    for sentence in text.split(['.', '!', '?']).map(str::trim).filter(|s| !s.is_empty()) {
        let words = sentence.split_whitespace().count();
        if word_count + words > max_words {
            break;
        }
        summary.push_str(sentence);
        summary.push_str(". ");
        word_count += words;
    }

    Summary {
        text: summary.trim_end().to_string(),
        word_count,
    }
}

#[async_trait]
impl Tool for TextSummaryTool {
    fn name(&self) -> &str {
        "text_summary"
    }

    fn description(&self) -> &str {
        "Summarizes long text content into concise key points. Useful for processing large amounts of text."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "text": { "type": "string", "description": "Text content to summarize" },
                "max_length": {
                    "type": "number",
                    "description": "Maximum length of summary in words (default: 100)"
                }
            },
            "required": ["text"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let text = arguments["text"]
            .as_str()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'text' argument".into()))?;
        let max_words = arguments["max_length"]
            .as_u64()
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_WORDS);

        let summary = summarize(text, max_words);
        if summary.text.is_empty() {
            return Ok(ToolResult::failure(format!(
                "First sentence is longer than {max_words} words"
            )));
        }

        let ratio = (summary.text.len() as f64 / text.len() as f64 * 100.0).round() as u64;
        Ok(ToolResult::ok(serde_json::json!({
            "summary": summary.text,
            "summary_length": summary.text.len(),
            "word_count": summary.word_count,
            "compression_ratio": ratio,
        })))
    }
}
