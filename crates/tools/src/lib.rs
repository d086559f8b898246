//! Reference tool implementations for agentrelay.
//!
//! These cover the invocation contract end to end; deployments register
//! their own tools alongside or instead of them.

pub mod calculator;
pub mod current_time;
pub mod text_summary;

use agentrelay_core::tool::ToolRegistry;

/// Create a registry with all built-in tools.
pub fn default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(calculator::CalculatorTool));
    registry.register(Box::new(current_time::CurrentTimeTool));
    registry.register(Box::new(text_summary::TextSummaryTool));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_lists_builtins() {
        let registry = default_registry();
        assert_eq!(registry.names(), vec!["calculator", "current_time", "text_summary"]);
    }

    #[tokio::test]
    async fn registry_runs_calculator() {
        let registry = default_registry();
        let result = registry
            .execute("calculator", serde_json::json!({"expression": "6 * 7"}))
            .await;
        assert!(result.success);
        assert_eq!(result.data.unwrap()["result"], 42.0);
    }
}
