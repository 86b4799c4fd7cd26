//! 内置演示工具：get_time / calculate

use async_trait::async_trait;
use chrono::Local;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::server::ToolHandler;
use crate::tools::input_schema_for;

/// 算式允许的字符
const ALLOWED_CHARS: &str = "0123456789+-*/()., ";

/// 当前本地时间（无参数）
pub struct GetTimeTool;

#[async_trait]
impl ToolHandler for GetTimeTool {
    fn name(&self) -> &str {
        "get_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time (ISO timestamp, date, time and timezone). Takes no arguments."
    }

    async fn call(&self, _args: Value) -> Result<Value, String> {
        let now = Local::now();
        Ok(json!({
            "status": "success",
            "datetime": now.to_rfc3339(),
            "date": now.format("%Y-%m-%d").to_string(),
            "time": now.format("%H:%M:%S").to_string(),
            "timezone": now.format("%:z").to_string(),
        }))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CalculateArgs {
    /// A mathematical expression to evaluate, e.g. "2 + 2" or "(10 - 4) / 3"
    pub expression: String,
}

/// 四则运算求值
pub struct CalculateTool;

#[async_trait]
impl ToolHandler for CalculateTool {
    fn name(&self) -> &str {
        "calculate"
    }

    fn description(&self) -> &str {
        "Safely evaluate an arithmetic expression using + - * / and parentheses."
    }

    fn input_schema(&self) -> Value {
        input_schema_for::<CalculateArgs>()
    }

    async fn call(&self, args: Value) -> Result<Value, String> {
        let args: CalculateArgs =
            serde_json::from_value(args).map_err(|e| format!("invalid arguments: {e}"))?;
        let result = evaluate(&args.expression)?;
        Ok(json!({
            "status": "success",
            "expression": args.expression,
            "result": number_value(result),
        }))
    }
}

/// 整数结果以整数输出
fn number_value(x: f64) -> Value {
    if x.fract() == 0.0 && x.abs() < 1e15 {
        json!(x as i64)
    } else {
        json!(x)
    }
}

/// 递归下降求值：expr := term (('+'|'-') term)*；term := factor (('*'|'/') factor)*；factor := ('+'|'-') factor | number | '(' expr ')'
pub fn evaluate(expression: &str) -> Result<f64, String> {
    if !expression.chars().all(|c| ALLOWED_CHARS.contains(c)) {
        return Err(
            "Expression contains invalid characters. Only basic math operations are allowed."
                .to_string(),
        );
    }
    let tokens: Vec<char> = expression.chars().filter(|c| !c.is_whitespace()).collect();
    if tokens.is_empty() {
        return Err("Calculation failed: empty expression".to_string());
    }
    let mut parser = Parser { tokens, pos: 0 };
    let value = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(format!(
            "Calculation failed: unexpected '{}' at position {}",
            parser.tokens[parser.pos], parser.pos
        ));
    }
    if !value.is_finite() {
        return Err("Calculation failed: division by zero".to_string());
    }
    Ok(value)
}

struct Parser {
    tokens: Vec<char>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.tokens.get(self.pos).copied()
    }

    fn expr(&mut self) -> Result<f64, String> {
        let mut value = self.term()?;
        while let Some(op @ ('+' | '-')) = self.peek() {
            self.pos += 1;
            let rhs = self.term()?;
            if op == '+' {
                value += rhs;
            } else {
                value -= rhs;
            }
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<f64, String> {
        let mut value = self.factor()?;
        while let Some(op @ ('*' | '/')) = self.peek() {
            self.pos += 1;
            let rhs = self.factor()?;
            if op == '*' {
                value *= rhs;
            } else {
                if rhs == 0.0 {
                    return Err("Calculation failed: division by zero".to_string());
                }
                value /= rhs;
            }
        }
        Ok(value)
    }

    fn factor(&mut self) -> Result<f64, String> {
        match self.peek() {
            Some('+') => {
                self.pos += 1;
                self.factor()
            }
            Some('-') => {
                self.pos += 1;
                Ok(-self.factor()?)
            }
            Some('(') => {
                self.pos += 1;
                let value = self.expr()?;
                if self.peek() != Some(')') {
                    return Err("Calculation failed: missing ')'".to_string());
                }
                self.pos += 1;
                Ok(value)
            }
            Some(c) if c.is_ascii_digit() || c == '.' => self.number(),
            Some(c) => Err(format!("Calculation failed: unexpected '{c}'")),
            None => Err("Calculation failed: unexpected end of expression".to_string()),
        }
    }

    fn number(&mut self) -> Result<f64, String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || c == '.' {
                self.pos += 1;
            } else if c == ',' {
                // 千位分隔符
                self.pos += 1;
            } else {
                break;
            }
        }
        let literal: String = self.tokens[start..self.pos]
            .iter()
            .filter(|c| **c != ',')
            .collect();
        literal
            .parse::<f64>()
            .map_err(|_| format!("Calculation failed: invalid number '{literal}'"))
    }
}
