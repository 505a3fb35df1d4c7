//! End-to-end integration tests covering the seed scenarios in §8: a broker
//! request/response round trip through a live `Runtime`, and a full RSI-driven
//! backtest run feeding the Monte Carlo simulator — exercising the crate the way a host
//! application would, rather than poking at internals.

use std::time::Duration;

use chrono::{TimeZone, Utc};

use trading_lab::acf::broker::{AgentInfo, Message, MessageKind};
use trading_lab::acf::tool_registry::ParamType;
use trading_lab::bte::indicators::rsi;
use trading_lab::bte::monte_carlo::{MonteCarloConfig, MonteCarloMethod, MonteCarloSimulator};
use trading_lab::bte::{BacktestConfig, BacktestEngine, Candle};
use trading_lab::{Config, Runtime};

fn synthetic_candles(n: usize) -> Vec<Candle> {
    (0..n)
        .map(|i| {
            let base = 100.0 + (i as f64 * 0.15).sin() * 4.0 + (i as f64) * 0.03;
            Candle {
                open_time: Utc.timestamp_opt(i as i64 * 300, 0).unwrap(),
                open: base,
                high: base + 1.0,
                low: base - 1.0,
                close: base + 0.2,
                volume: 1_000.0,
            }
        })
        .collect()
}

#[tokio::test]
async fn runtime_wires_broker_kv_and_indicator_tools_together() {
    let runtime = Runtime::new(Config::default());

    runtime.broker.register_agent(AgentInfo::new("worker", "generic"));
    let ping = Message::new(MessageKind::Event, "system", "lifecycle", serde_json::json!({})).to("worker");
    runtime.broker.send(ping).unwrap();
    let received = runtime.broker.receive("worker");
    assert!(received.is_some());
    assert_eq!(received.unwrap().topic, "lifecycle");

    runtime.kv.set("worker", "last_seen", serde_json::json!("ping"), None);
    assert_eq!(runtime.kv.get("last_seen"), Some(serde_json::json!("ping")));

    let closes: Vec<f64> = synthetic_candles(60).iter().map(|c| c.close).collect();
    let tool_result = runtime
        .tools
        .execute("indicator_rsi", serde_json::json!({ "closes": closes, "period": 14 }))
        .await
        .unwrap();
    assert!(tool_result.success);

    let sma_tool = runtime.tools.get("indicator_sma").unwrap();
    assert_eq!(sma_tool.params[1].param_type, ParamType::Integer);
}

#[tokio::test]
async fn broker_request_response_resolves_within_timeout() {
    let runtime = Runtime::new(Config::default());
    runtime.broker.register_agent(AgentInfo::new("server", "generic"));
    runtime.broker.register_agent(AgentInfo::new("client", "generic"));

    let broker = runtime.broker.clone();
    tokio::spawn(async move {
        for _ in 0..50 {
            if let Some(request) = broker.receive("server") {
                broker.respond(&request, serde_json::json!({"ok": true})).unwrap();
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });

    let response = runtime.broker.request("client", "server", "ping", serde_json::json!({}), 2.0).await.unwrap();
    assert_eq!(response, serde_json::json!({"ok": true}));
}

/// Runs an RSI mean-reversion strategy over a synthetic series and feeds the resulting
/// trade list into the Monte Carlo simulator, mirroring seed scenario #6's shape: a
/// completed backtest's trades resampled and summarized.
#[test]
fn backtest_output_feeds_monte_carlo_analysis() {
    let candles = synthetic_candles(300);
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let rsi_values = rsi(&closes, 14);

    let long_entries: Vec<bool> = rsi_values.iter().map(|v| v.is_finite() && *v < 35.0).collect();
    let long_exits: Vec<bool> = rsi_values.iter().map(|v| v.is_finite() && *v > 65.0).collect();
    let short_entries = vec![false; candles.len()];
    let short_exits = vec![false; candles.len()];

    let engine = BacktestEngine::new(BacktestConfig::default());
    let output = engine.run(&candles, &long_entries, &long_exits, &short_entries, &short_exits);
    assert!(output.is_valid, "{:?}", output.validation_errors);

    if output.trades.is_empty() {
        return;
    }

    let simulator = MonteCarloSimulator::new(MonteCarloConfig { n_simulations: 500, block_size: 8, seed: Some(123) });
    let mc = simulator.analyze_trades(
        &output.trades,
        BacktestConfig::default().initial_capital,
        0.0,
        MonteCarloMethod::Permutation,
    );
    assert_eq!(mc.simulated_returns.len(), 500);
    assert!(mc.return_ci_95.0 <= mc.return_ci_95.1);
    assert!((0.0..=1.0).contains(&mc.prob_positive_return));
}
