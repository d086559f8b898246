//! Calculator tool: arithmetic over decimal numbers.
//!
//! Operators `+ - * / % ^` with parentheses and unary minus. Parsing uses
//! precedence climbing; `^` is right-associative and binds tighter than
//! unary minus, so `-2 ^ 2` is `-4`.

use agentrelay_core::error::ToolError;
use agentrelay_core::tool::{Tool, ToolResult};
use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

pub struct CalculatorTool;

#[async_trait]
impl Tool for CalculatorTool {
    fn name(&self) -> &str {
        "calculator"
    }

    fn description(&self) -> &str {
        "Evaluates an arithmetic expression. Supports + - * / % ^, parentheses and decimals."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "expression": {
                    "type": "string",
                    "description": "Arithmetic expression, e.g. '(2 + 3) * 4'"
                }
            },
            "required": ["expression"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let Some(expression) = arguments.get("expression").and_then(|v| v.as_str()) else {
            return Err(ToolError::InvalidArguments("'expression' must be a string".into()));
        };

        Ok(match evaluate(expression) {
            Ok(value) => {
                debug!(expression = %expression, value, "Evaluated expression");
                ToolResult::ok(serde_json::json!({
                    "expression": expression,
                    "result": value,
                    "formatted": display(value),
                }))
            }
            Err(e) => ToolResult::failure(format!("Calculation failed: {e}")),
        })
    }
}

fn display(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        (value as i64).to_string()
    } else {
        value.to_string()
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum CalcError {
    #[error("unexpected character '{0}' at offset {1}")]
    BadCharacter(char, usize),
    #[error("'{0}' is not a number")]
    BadNumber(String),
    #[error("expression ended early")]
    UnexpectedEnd,
    #[error("unexpected {0}")]
    UnexpectedToken(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("result is not a finite number")]
    NotFinite,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Tok {
    Num(f64),
    Op(char),
    Open,
    Close,
}

impl Tok {
    fn describe(self) -> String {
        match self {
            Tok::Num(n) => format!("number {n}"),
            Tok::Op(op) => format!("operator '{op}'"),
            Tok::Open => "'('".into(),
            Tok::Close => "')'".into(),
        }
    }
}

fn lex(source: &str) -> Result<Vec<Tok>, CalcError> {
    let mut toks = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(at, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c.is_ascii_digit() || c == '.' {
            let mut literal = String::new();
            while let Some(&(_, d)) = chars.peek() {
                if !(d.is_ascii_digit() || d == '.') {
                    break;
                }
                literal.push(d);
                chars.next();
            }
            let value = literal.parse().map_err(|_| CalcError::BadNumber(literal))?;
            toks.push(Tok::Num(value));
            continue;
        }
        toks.push(match c {
            '+' | '-' | '*' | '/' | '%' | '^' => Tok::Op(c),
            '(' => Tok::Open,
            ')' => Tok::Close,
            other => return Err(CalcError::BadCharacter(other, at)),
        });
        chars.next();
    }

    Ok(toks)
}

/// Binding power of a binary operator and whether it groups to the right.
fn binding(op: char) -> (u8, bool) {
    match op {
        '+' | '-' => (1, false),
        '*' | '/' | '%' => (2, false),
        _ => (4, true),
    }
}

/// Unary minus sits between the multiplicative operators and `^`.
const PREFIX_POWER: u8 = 3;

fn apply(op: char, lhs: f64, rhs: f64) -> Result<f64, CalcError> {
    let value = match op {
        '+' => lhs + rhs,
        '-' => lhs - rhs,
        '*' => lhs * rhs,
        '/' if rhs == 0.0 => return Err(CalcError::DivisionByZero),
        '/' => lhs / rhs,
        '%' if rhs == 0.0 => return Err(CalcError::DivisionByZero),
        '%' => lhs % rhs,
        _ => lhs.powf(rhs),
    };
    if value.is_finite() { Ok(value) } else { Err(CalcError::NotFinite) }
}

struct Climber<'a> {
    toks: &'a [Tok],
    at: usize,
}

impl Climber<'_> {
    fn next(&mut self) -> Option<Tok> {
        let tok = self.toks.get(self.at).copied();
        self.at += 1;
        tok
    }

    fn expression(&mut self, min_power: u8) -> Result<f64, CalcError> {
        let mut lhs = self.operand()?;

        while let Some(Tok::Op(op)) = self.toks.get(self.at).copied() {
            let (power, right_assoc) = binding(op);
            if power < min_power {
                break;
            }
            self.at += 1;
            let rhs = self.expression(if right_assoc { power } else { power + 1 })?;
            lhs = apply(op, lhs, rhs)?;
        }

        Ok(lhs)
    }

    fn operand(&mut self) -> Result<f64, CalcError> {
        match self.next() {
            Some(Tok::Num(n)) => Ok(n),
            Some(Tok::Op('-')) => Ok(-self.expression(PREFIX_POWER)?),
            Some(Tok::Op('+')) => self.expression(PREFIX_POWER),
            Some(Tok::Open) => {
                let inner = self.expression(0)?;
                match self.next() {
                    Some(Tok::Close) => Ok(inner),
                    Some(other) => Err(CalcError::UnexpectedToken(other.describe())),
                    None => Err(CalcError::UnexpectedEnd),
                }
            }
            Some(other) => Err(CalcError::UnexpectedToken(other.describe())),
            None => Err(CalcError::UnexpectedEnd),
        }
    }
}

/// Evaluate an arithmetic expression.
pub fn evaluate(source: &str) -> Result<f64, CalcError> {
    let toks = lex(source)?;
    let mut climber = Climber { toks: &toks, at: 0 };
    let value = climber.expression(0)?;
    match toks.get(climber.at) {
        None => Ok(value),
        Some(extra) => Err(CalcError::UnexpectedToken(extra.describe())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_and_grouping() {
        assert_eq!(evaluate("2 + 3 * 4").unwrap(), 14.0);
        assert_eq!(evaluate("(2 + 3) * 4").unwrap(), 20.0);
        assert_eq!(evaluate("((1 + 2) * (3 + 4))").unwrap(), 21.0);
        assert_eq!(evaluate("10 - 4 - 3").unwrap(), 3.0);
    }

    #[test]
    fn powers_group_right_and_beat_negation() {
        assert_eq!(evaluate("2 ^ 3 ^ 2").unwrap(), 512.0);
        assert_eq!(evaluate("-2 ^ 2").unwrap(), -4.0);
        assert_eq!(evaluate("2 ^ -1").unwrap(), 0.5);
    }

    #[test]
    fn unary_minus() {
        assert_eq!(evaluate("-5 + 3").unwrap(), -2.0);
        assert_eq!(evaluate("4 * -2").unwrap(), -8.0);
        assert_eq!(evaluate("--1").unwrap(), 1.0);
    }

    #[test]
    fn decimals_and_modulo() {
        assert!((evaluate("3.14 * 2").unwrap() - 6.28).abs() < 1e-12);
        assert_eq!(evaluate("17 % 5").unwrap(), 2.0);
        let mixed = evaluate("(10 + 5) / 3 - 2 * (1 + 1)").unwrap();
        assert!((mixed - 1.0).abs() < 1e-10);
    }

    #[test]
    fn errors() {
        assert_eq!(evaluate("1 / 0"), Err(CalcError::DivisionByZero));
        assert_eq!(evaluate("4 % 0"), Err(CalcError::DivisionByZero));
        assert_eq!(evaluate("2 +"), Err(CalcError::UnexpectedEnd));
        assert_eq!(evaluate(""), Err(CalcError::UnexpectedEnd));
        assert_eq!(evaluate("2 $ 3"), Err(CalcError::BadCharacter('$', 2)));
        assert_eq!(evaluate("1.2.3"), Err(CalcError::BadNumber("1.2.3".into())));
        assert!(matches!(evaluate("(1 + 2"), Err(CalcError::UnexpectedEnd)));
        assert!(matches!(evaluate("1 2"), Err(CalcError::UnexpectedToken(_))));
        assert_eq!(evaluate("10 ^ 400"), Err(CalcError::NotFinite));
    }

    #[tokio::test]
    async fn tool_reports_result_and_formatting() {
        let result = CalculatorTool
            .execute(serde_json::json!({"expression": "2 + 3"}))
            .await
            .unwrap();
        assert!(result.success);
        let data = result.data.unwrap();
        assert_eq!(data["result"], 5.0);
        assert_eq!(data["formatted"], "5");

        let result = CalculatorTool
            .execute(serde_json::json!({"expression": "10 / 3"}))
            .await
            .unwrap();
        assert!(result.data.unwrap()["formatted"].as_str().unwrap().starts_with("3.333"));
    }

    #[tokio::test]
    async fn bad_expression_is_a_failed_result() {
        let result = CalculatorTool
            .execute(serde_json::json!({"expression": "2 +"}))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Calculation failed: expression ended early"));
    }

    #[tokio::test]
    async fn missing_expression_is_invalid_arguments() {
        let result = CalculatorTool.execute(serde_json::json!({})).await;
        assert!(matches!(result, Err(ToolError::InvalidArguments(_))));
    }

    #[test]
    fn definition_requires_expression() {
        let def = CalculatorTool.to_definition();
        assert_eq!(def.name, "calculator");
        assert_eq!(def.input_schema["required"][0], "expression");
    }
}
