//! Operator subcommand implementations.
//!
//! Each subcommand is a thin HTTP (or WebSocket, for `watch`) client
//! against a running fishbowl server. Output goes to stdout as plain
//! aligned text; exit codes are non-zero when the server reports
//! failure.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_tungstenite::tungstenite;

use crate::cli::Commands;

/// Dispatch a parsed operator subcommand.
pub async fn run(command: Commands, server: &str) -> Result<()> {
    match command {
        Commands::List => list(server).await,
        Commands::Approve { ids, all } => decide(server, ids, all, true).await,
        Commands::Deny { ids, all } => decide(server, ids, all, false).await,
        Commands::Watch => watch(server).await,
        Commands::Rules => rules(server).await,
        Commands::Allow { rule } => add_rule(server, "allow", &rule).await,
        Commands::DenyRule { rule } => add_rule(server, "deny", &rule).await,
    }
}

async fn get(server: &str, path: &str) -> Result<Value> {
    let url = format!("{}{}", server, path);
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("GET {} failed: is the server running?", url))?;
    response.json().await.context("invalid JSON response")
}

async fn post(server: &str, path: &str, body: Value) -> Result<Value> {
    let url = format!("{}{}", server, path);
    let response = reqwest::Client::new()
        .post(&url)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("POST {} failed: is the server running?", url))?;
    response.json().await.context("invalid JSON response")
}

async fn list(server: &str) -> Result<()> {
    let queue = get(server, "/api/queue").await?;
    let pending = queue["pending"].as_array().cloned().unwrap_or_default();

    if pending.is_empty() {
        println!("No pending requests.");
        return Ok(());
    }

    for request in &pending {
        print_request(request);
    }
    println!("{} pending", pending.len());
    Ok(())
}

fn print_request(request: &Value) {
    let id = request["id"].as_str().unwrap_or("?");
    let category = request["category"].as_str().unwrap_or("?");
    let action = request["action"].as_str().unwrap_or("");
    let reason = request["reason"].as_str();

    println!("{:<8} {:<11} {}", id, category, action);
    if let Some(reason) = reason {
        println!("{:<8} {:<11} reason: {}", "", "", reason);
    }
}

async fn decide(server: &str, ids: Vec<String>, all: Option<String>, approve: bool) -> Result<()> {
    let verb = if approve { "approve" } else { "deny" };

    if let Some(category) = all {
        let status = if approve { "approved" } else { "denied" };
        let body = json!({"category": category, "status": status, "resolvedBy": "cli"});
        let response = post(server, "/api/queue/bulk", body).await?;
        match response.get("count").and_then(Value::as_u64) {
            Some(count) => println!("{}d {} {} request(s)", verb, count, category),
            None => anyhow::bail!(
                "bulk {} failed: {}",
                verb,
                response["error"].as_str().unwrap_or("unknown error")
            ),
        }
        return Ok(());
    }

    if ids.is_empty() {
        anyhow::bail!("provide request ids or --all <category>");
    }

    let mut failed = false;
    for id in ids {
        let path = format!("/api/queue/{}/{}", id, verb);
        let response = post(server, &path, json!({"resolvedBy": "cli"})).await?;
        if response["ok"].as_bool() == Some(true) {
            println!("{}d {}", verb, id);
        } else {
            failed = true;
            println!(
                "failed to {} {}: {}",
                verb,
                id,
                response["error"].as_str().unwrap_or("unknown error")
            );
        }
    }
    if failed {
        anyhow::bail!("some requests could not be resolved");
    }
    Ok(())
}

async fn rules(server: &str) -> Result<()> {
    let rules = get(server, "/api/rules").await?;
    println!("allow:");
    for rule in rules["allow"].as_array().cloned().unwrap_or_default() {
        println!("  {}", rule.as_str().unwrap_or("?"));
    }
    println!("deny:");
    for rule in rules["deny"].as_array().cloned().unwrap_or_default() {
        println!("  {}", rule.as_str().unwrap_or("?"));
    }
    Ok(())
}

async fn add_rule(server: &str, kind: &str, rule: &str) -> Result<()> {
    let response = post(server, "/api/rules", json!({"type": kind, "rule": rule})).await?;
    if response["added"].as_bool() == Some(true) {
        println!("added {} rule: {}", kind, rule);
        Ok(())
    } else {
        anyhow::bail!("rule not added (unparseable or duplicate): {}", rule)
    }
}

/// Stream queue events over WebSocket and accept stdin decisions.
async fn watch(server: &str) -> Result<()> {
    let ws_url = format!("{}/ws", server.replacen("http", "ws", 1));
    let (ws, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .with_context(|| format!("WebSocket connect to {} failed", ws_url))?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    println!("watching {}: a <id> approve, d <id> deny, A <cat> / D <cat> bulk, q quit", server);

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();

    loop {
        tokio::select! {
            frame = ws_rx.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    _ => {
                        println!("connection closed");
                        return Ok(());
                    }
                };
                let Ok(text) = frame.into_text() else { continue };
                let Ok(message) = serde_json::from_str::<Value>(&text) else { continue };
                print_event(&message);
                if message["type"] == "shutdown" {
                    return Ok(());
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { return Ok(()) };
                let line = line.trim();
                let mut parts = line.split_whitespace();
                match (parts.next(), parts.next()) {
                    (Some("q"), _) => return Ok(()),
                    (Some("a"), Some(id)) => {
                        let msg = json!({"type": "approve", "id": id, "resolvedBy": "cli"});
                        ws_tx.send(tungstenite::Message::text(msg.to_string())).await?;
                    }
                    (Some("d"), Some(id)) => {
                        let msg = json!({"type": "deny", "id": id, "resolvedBy": "cli"});
                        ws_tx.send(tungstenite::Message::text(msg.to_string())).await?;
                    }
                    (Some("A"), Some(category)) => {
                        let body = json!({"category": category, "status": "approved", "resolvedBy": "cli"});
                        let response = post(server, "/api/queue/bulk", body).await?;
                        println!("approved {} request(s)", response["count"]);
                    }
                    (Some("D"), Some(category)) => {
                        let body = json!({"category": category, "status": "denied", "resolvedBy": "cli"});
                        let response = post(server, "/api/queue/bulk", body).await?;
                        println!("denied {} request(s)", response["count"]);
                    }
                    (None, _) => {}
                    _ => println!("commands: a <id>, d <id>, A <cat>, D <cat>, q"),
                }
            }
        }
    }
}

fn print_event(message: &Value) {
    match message["type"].as_str() {
        Some("init") => {
            let pending = message["data"]["pending"].as_array().cloned().unwrap_or_default();
            println!("{} pending request(s)", pending.len());
            for request in &pending {
                print_request(request);
            }
        }
        Some("request") => {
            let data = &message["data"];
            println!(
                "new      {:<8} {:<11} {}",
                data["id"].as_str().unwrap_or("?"),
                data["category"].as_str().unwrap_or("?"),
                data["action"].as_str().unwrap_or(""),
            );
        }
        Some("resolve") => {
            let data = &message["data"];
            println!(
                "{:<8} {:<8} by {}",
                data["status"].as_str().unwrap_or("?"),
                data["id"].as_str().unwrap_or("?"),
                data["resolvedBy"].as_str().unwrap_or("?"),
            );
        }
        Some("rules") => println!("rules updated"),
        Some("shutdown") => println!(
            "server shutting down: {}",
            message["data"]["reason"].as_str().unwrap_or("?")
        ),
        Some("error") => println!(
            "error: {}",
            message["data"]["error"].as_str().unwrap_or("?")
        ),
        _ => {}
    }
}
