//! Indicator MCP tools.
//!
//! Registers the C12 indicator set (SMA/EMA/RSI/MACD) as tools on a [`ToolRegistry`],
//! grounded on `examples/original_source/backend/agents/mcp/tools/indicators.py` and
//! `mcp/protocol.py::create_trading_mcp_server`'s seed registration call. This is the
//! natural "first tool" wired end-to-end through C10 (registry) and C11 (MCP), giving an
//! agent calling through MCP direct access to the same indicator math the backtest
//! engine uses, without duplicating it.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::tool_registry::{ParamType, Parameter, Permission, Tool, ToolBuilder, ToolHandler, ToolRegistry};
use crate::bte::indicators::{ema, macd, rsi, sma};

fn closes_arg(args: &Value) -> Result<Vec<f64>, String> {
    args.get("closes")
        .and_then(|v| v.as_array())
        .ok_or_else(|| "missing array parameter: closes".to_string())?
        .iter()
        .map(|v| v.as_f64().ok_or_else(|| "closes must be an array of numbers".to_string()))
        .collect()
}

fn period_arg(args: &Value, default: u64) -> Result<usize, String> {
    Ok(args.get("period").and_then(|v| v.as_u64()).unwrap_or(default) as usize)
}

struct SmaTool;

#[async_trait]
impl ToolHandler for SmaTool {
    async fn call(&self, args: Value) -> Result<Value, String> {
        let closes = closes_arg(&args)?;
        let period = period_arg(&args, 20)?;
        Ok(serde_json::json!({ "sma": sma(&closes, period) }))
    }
}

struct EmaTool;

#[async_trait]
impl ToolHandler for EmaTool {
    async fn call(&self, args: Value) -> Result<Value, String> {
        let closes = closes_arg(&args)?;
        let period = period_arg(&args, 20)?;
        Ok(serde_json::json!({ "ema": ema(&closes, period) }))
    }
}

struct RsiTool;

#[async_trait]
impl ToolHandler for RsiTool {
    async fn call(&self, args: Value) -> Result<Value, String> {
        let closes = closes_arg(&args)?;
        let period = period_arg(&args, 14)?;
        Ok(serde_json::json!({ "rsi": rsi(&closes, period) }))
    }
}

struct MacdTool;

#[async_trait]
impl ToolHandler for MacdTool {
    async fn call(&self, args: Value) -> Result<Value, String> {
        let closes = closes_arg(&args)?;
        let fast = period_arg(&args, 12)?;
        let slow = args.get("slow").and_then(|v| v.as_u64()).unwrap_or(26) as usize;
        let signal = args.get("signal").and_then(|v| v.as_u64()).unwrap_or(9) as usize;
        let result = macd(&closes, fast, slow, signal);
        Ok(serde_json::json!({
            "macd_line": result.macd_line,
            "signal_line": result.signal_line,
            "histogram": result.histogram,
        }))
    }
}

fn closes_param() -> Parameter {
    let mut p = Parameter::new("closes", ParamType::Array);
    p.item_type = Some(ParamType::Number);
    p.description = "close prices, oldest first".to_string();
    p
}

fn period_param(name: &str, default: u64, description: &str) -> Parameter {
    let mut p = Parameter::new(name, ParamType::Integer);
    p.required = false;
    p.default = Some(Value::from(default));
    p.description = description.to_string();
    p
}

fn sma_tool() -> Tool {
    ToolBuilder::new("indicator_sma", "Simple moving average over a close-price series")
        .category("indicators")
        .permission(Permission::Public)
        .param(closes_param())
        .param(period_param("period", 20, "lookback window"))
        .build(Arc::new(SmaTool))
}

fn ema_tool() -> Tool {
    ToolBuilder::new("indicator_ema", "Exponential moving average over a close-price series")
        .category("indicators")
        .permission(Permission::Public)
        .param(closes_param())
        .param(period_param("period", 20, "lookback window"))
        .build(Arc::new(EmaTool))
}

fn rsi_tool() -> Tool {
    ToolBuilder::new("indicator_rsi", "Wilder-smoothed relative strength index")
        .category("indicators")
        .permission(Permission::Public)
        .param(closes_param())
        .param(period_param("period", 14, "lookback window"))
        .build(Arc::new(RsiTool))
}

fn macd_tool() -> Tool {
    ToolBuilder::new("indicator_macd", "Moving average convergence/divergence")
        .category("indicators")
        .permission(Permission::Public)
        .param(closes_param())
        .param(period_param("fast", 12, "fast EMA period"))
        .param(period_param("slow", 26, "slow EMA period"))
        .param(period_param("signal", 9, "signal line EMA period"))
        .build(Arc::new(MacdTool))
}

/// Registers the indicator tool seed set. Called once from [`super::Runtime::new`].
pub fn register_default_tools(registry: &ToolRegistry) {
    registry.add(sma_tool());
    registry.add(ema_tool());
    registry.add(rsi_tool());
    registry.add(macd_tool());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sma_tool_executes_through_the_registry() {
        let registry = ToolRegistry::new();
        register_default_tools(&registry);
        let closes: Vec<f64> = (1..=30).map(|i| i as f64).collect();
        let result = registry
            .execute("indicator_sma", serde_json::json!({ "closes": closes, "period": 5 }))
            .await
            .unwrap();
        assert!(result.success);
        let sma_out = result.data.unwrap()["sma"].as_array().unwrap().len();
        assert_eq!(sma_out, 30);
    }

    #[tokio::test]
    async fn macd_tool_returns_three_series_of_equal_length() {
        let registry = ToolRegistry::new();
        register_default_tools(&registry);
        let closes: Vec<f64> = (1..=60).map(|i| (i as f64 * 0.1).sin() + i as f64 * 0.05).collect();
        let result = registry.execute("indicator_macd", serde_json::json!({ "closes": closes })).await.unwrap();
        assert!(result.success);
        let data = result.data.unwrap();
        let macd_len = data["macd_line"].as_array().unwrap().len();
        let signal_len = data["signal_line"].as_array().unwrap().len();
        let hist_len = data["histogram"].as_array().unwrap().len();
        assert_eq!(macd_len, 60);
        assert_eq!(signal_len, 60);
        assert_eq!(hist_len, 60);
    }

    #[tokio::test]
    async fn missing_closes_argument_fails_cleanly() {
        let registry = ToolRegistry::new();
        register_default_tools(&registry);
        let result = registry.execute("indicator_rsi", serde_json::json!({})).await.unwrap();
        assert!(!result.success);
        assert!(result.error.is_some());
    }
}
