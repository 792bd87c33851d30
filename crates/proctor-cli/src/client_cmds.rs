//! Operator commands that talk to a running `proctor serve` over its REST
//! surface.

use anyhow::{Context, Result, bail};

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

async fn check(response: reqwest::Response) -> Result<serde_json::Value> {
    let status = response.status();
    let body: serde_json::Value = response
        .json()
        .await
        .unwrap_or_else(|_| serde_json::json!({}));
    if !status.is_success() {
        bail!(
            "server returned {status}: {}",
            body.get("error").and_then(|e| e.as_str()).unwrap_or("?")
        );
    }
    Ok(body)
}

/// `proctor submit`: enqueue an execution request.
pub async fn run_submit(
    server: &str,
    test_file_path: Option<&str>,
    grep: Option<&str>,
) -> Result<()> {
    let body = serde_json::json!({
        "test_file_path": test_file_path,
        "grep": grep,
    });
    let response = client()
        .post(format!("{server}/api/executions"))
        .json(&body)
        .send()
        .await
        .with_context(|| format!("failed to reach {server}"))?;
    let json = check(response).await?;
    println!(
        "Execution submitted: {}",
        json["execution_id"].as_str().unwrap_or("?")
    );
    Ok(())
}

/// `proctor cancel`: request cancellation of an execution.
pub async fn run_cancel(server: &str, execution_id: &str) -> Result<()> {
    let response = client()
        .post(format!("{server}/api/executions/{execution_id}/cancel"))
        .send()
        .await
        .with_context(|| format!("failed to reach {server}"))?;
    check(response).await?;
    println!("Cancellation requested for {execution_id}.");
    Ok(())
}

/// `proctor status`: print queue depths and bus counters.
pub async fn run_status(server: &str) -> Result<()> {
    let response = client()
        .get(format!("{server}/api/stats"))
        .send()
        .await
        .with_context(|| format!("failed to reach {server}"))?;
    let json = check(response).await?;

    let queues = &json["queues"];
    println!("Queues:");
    for name in ["critical", "high", "default", "dlq"] {
        println!("  {name:<10} {}", queues[name].as_u64().unwrap_or(0));
    }

    let metrics = &json["metrics"];
    println!("Counters:");
    for name in [
        "enqueued",
        "deduplicated",
        "consumed",
        "acknowledged",
        "retried",
        "dead_lettered",
    ] {
        println!("  {name:<14} {}", metrics[name].as_u64().unwrap_or(0));
    }
    println!(
        "  avg queue wait {:.1} ms",
        metrics["avg_queue_wait_ms"].as_f64().unwrap_or(0.0)
    );
    Ok(())
}

/// `proctor reset`: administrative bus reset.
pub async fn run_reset(server: &str) -> Result<()> {
    let response = client()
        .post(format!("{server}/api/admin/reset"))
        .send()
        .await
        .with_context(|| format!("failed to reach {server}"))?;
    let json = check(response).await?;
    println!(
        "Bus reset: {} queued before, {} keys deleted, {} after.",
        json["before"].as_u64().unwrap_or(0),
        json["deleted"].as_u64().unwrap_or(0),
        json["after"].as_u64().unwrap_or(0),
    );
    Ok(())
}
