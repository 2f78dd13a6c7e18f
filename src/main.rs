//! Tagteam 演示入口
//!
//! 加载配置、注册一个模拟能力、启动轮换引擎，提交几次质量逐步下降的任务，
//! 打印每个任务的健康分、轮换决策与台账记录。
//!
//! 用法：`tagteam [config.toml]`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};

use tagteam::config::load_config;
use tagteam::dispatch::{
    AccessLevel, Capability, CapabilityRegistry, CostRange, ExecutionContext, TimeRange,
};
use tagteam::health::ExecutionMetrics;
use tagteam::ledger::BookkeepingOnly;
use tagteam::RotationEngine;

/// 模拟能力：按 params.quality（0-1）生成遥测，质量过低时执行失败
struct ResearchBrief {
    cost: CostRange,
    time: TimeRange,
}

#[async_trait]
impl Capability for ResearchBrief {
    fn id(&self) -> &str {
        "research-brief"
    }

    fn estimated_cost(&self) -> CostRange {
        self.cost
    }

    fn estimated_time(&self) -> TimeRange {
        self.time
    }

    fn skills(&self) -> Vec<String> {
        vec!["web-search".to_string()]
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<Value, String> {
        let quality = ctx
            .params
            .get("quality")
            .and_then(Value::as_f64)
            .unwrap_or(1.0)
            .clamp(0.0, 1.0);

        ctx.report_progress(25);
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.report_progress(75);

        let claims = 10u32;
        ctx.report_metrics(ExecutionMetrics {
            response_tokens: 600,
            prompt_tokens: 2_000,
            latency_ms: (1_000.0 + (1.0 - quality) * 8_000.0) as u64,
            factual_claims: claims,
            verified_claims: (quality * claims as f64).round() as u32,
            context_references: (quality * 5.0).round() as u32,
            expected_context_refs: 5,
            logical_errors: ((1.0 - quality) * 6.0).round() as u32,
            total_statements: 10,
        });

        if quality < 0.2 {
            return Err(format!("{} produced unusable output", ctx.model));
        }
        Ok(json!({ "summary": format!("brief drafted by {}", ctx.model) }))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tagteam::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;

    let capability = ResearchBrief {
        cost: "$0.05-0.15".parse().map_err(anyhow::Error::msg)?,
        time: "10-30 seconds".parse().map_err(anyhow::Error::msg)?,
    };
    let mut registry = CapabilityRegistry::new();
    registry.register(capability);

    let (engine, mut reports) =
        RotationEngine::start(&config, registry, Arc::new(BookkeepingOnly))
            .context("Failed to start rotation engine")?;

    let qualities = [0.95, 0.6, 0.1, 0.9];
    for quality in qualities {
        let task_id = engine
            .submit(
                "research-brief",
                json!({ "quality": quality }),
                "demo-user",
                AccessLevel::Public,
            )
            .context("Failed to submit task")?;
        let report = reports
            .recv()
            .await
            .context("Completion pipeline stopped")?;
        println!("== {task_id}");
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "status": report.task.status,
                "model": report.task.model,
                "delegated_to": report.task.delegated_to,
                "error": report.task.error,
                "health": report.health,
                "rotation": report.rotation,
                "entry": report.entry,
            }))?
        );
    }

    let summary = engine.ledger_book().summary("demo-user").await;
    println!("== ledger summary");
    println!("{}", serde_json::to_string_pretty(&summary)?);
    println!(
        "next model for research-brief: {}",
        engine
            .current_model("research-brief")
            .unwrap_or_else(|| "-".to_string())
    );

    Ok(())
}
