//! # campuslink
//!
//! Command-line client for the storefront push channel. Opens a real-time
//! session, prints connection snapshots and inbound events as JSON lines on
//! stdout, sends any `--emit` messages and closes cleanly on Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use campuslink_core::logging::init_subscriber;
use campuslink_realtime::transport::WebSocketTransport;
use campuslink_realtime::{ConnectionSnapshot, Credentials, RealtimeSession, Subscription};
use campuslink_settings::{LinkSettings, load_settings_from_path, settings_path};
use clap::Parser;
use serde_json::{Value, json};
use tracing::{info, warn};

/// Campus storefront real-time client.
#[derive(Parser, Debug)]
#[command(name = "campuslink", about = "Campus storefront real-time client")]
struct Cli {
    /// Settings file (defaults to `~/.campuslink/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Push server endpoint (overrides settings).
    #[arg(long)]
    server_url: Option<String>,

    /// Session token presented on every connect attempt.
    #[arg(long, env = "CAMPUSLINK_TOKEN", hide_env_values = true)]
    token: String,

    /// Log filter (overrides settings).
    #[arg(long)]
    log_level: Option<String>,

    /// Only print these inbound events. Repeatable; all events when omitted.
    #[arg(long = "subscribe", value_name = "EVENT")]
    subscriptions: Vec<String>,

    /// Send a message once the session is open, as `event=<json>`. Repeatable.
    #[arg(long = "emit", value_name = "EVENT=JSON", value_parser = parse_emit)]
    emits: Vec<(String, Value)>,
}

impl Cli {
    fn load_settings(&self) -> Result<LinkSettings> {
        let path = self.settings.clone().unwrap_or_else(settings_path);
        let mut settings = load_settings_from_path(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?;
        if let Some(url) = &self.server_url {
            settings.server_url.clone_from(url);
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        settings.validate().context("Invalid settings after command-line overrides")?;
        Ok(settings)
    }
}

/// Parse `event=<json>`. A payload that is not valid JSON is sent as a string.
fn parse_emit(raw: &str) -> Result<(String, Value)> {
    let Some((event, payload)) = raw.split_once('=') else {
        bail!("expected EVENT=JSON, got {raw:?}");
    };
    let event = event.trim();
    if event.is_empty() {
        bail!("event name must not be empty");
    }
    let payload = serde_json::from_str(payload).unwrap_or_else(|_| Value::String(payload.to_owned()));
    Ok((event.to_owned(), payload))
}

fn print_line(line: &Value) {
    println!("{line}");
}

fn state_line(snapshot: &ConnectionSnapshot) -> Value {
    json!({ "kind": "state", "label": snapshot.state.label(), "snapshot": snapshot })
}

fn subscribe(session: &RealtimeSession, events: &[String]) -> Vec<Subscription> {
    if events.is_empty() {
        return vec![session.subscribe_all(|event, payload| {
            print_line(&json!({ "kind": "event", "event": event, "data": payload }));
            Ok(())
        })];
    }
    events
        .iter()
        .map(|name| {
            let event = name.clone();
            session.subscribe(name.clone(), move |payload| {
                print_line(&json!({ "kind": "event", "event": event, "data": payload }));
                Ok(())
            })
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.load_settings()?;
    init_subscriber(&settings.logging.level, settings.logging.format);

    let transport = Arc::new(WebSocketTransport::new(settings.server_url.clone()));
    let session = RealtimeSession::build(&settings, transport, Credentials::bearer(cli.token.clone()));
    let _state = session.on_state_change(|snapshot| print_line(&state_line(snapshot)));
    let _events = subscribe(&session, &cli.subscriptions);

    let outcome = session.start().await;
    info!(url = %settings.server_url, ?outcome, "session opened");

    for (event, payload) in cli.emits {
        match session.emit(event.clone(), payload).await {
            Ok(outcome) => print_line(&json!({
                "kind": "emit",
                "event": event,
                "id": outcome.id(),
                "sent": outcome.is_sent(),
            })),
            Err(error) => warn!(%event, %error, "emit rejected"),
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    let leftover = session.close().await;
    if !leftover.is_empty() {
        warn!(count = leftover.len(), "closed with undelivered messages");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn emit_with_json_payload() {
        let (event, payload) = parse_emit(r#"cart:add={"sku":"mug","qty":2}"#).unwrap();
        assert_eq!(event, "cart:add");
        assert_eq!(payload, json!({"sku": "mug", "qty": 2}));
    }

    #[test]
    fn emit_with_plain_text_payload() {
        let (event, payload) = parse_emit("chat:message=hello there").unwrap();
        assert_eq!(event, "chat:message");
        assert_eq!(payload, json!("hello there"));
    }

    #[test]
    fn emit_payload_may_contain_equals() {
        let (_, payload) = parse_emit("note=a=b").unwrap();
        assert_eq!(payload, json!("a=b"));
    }

    #[test]
    fn emit_requires_separator_and_name() {
        assert_matches!(parse_emit("cart:add"), Err(_));
        assert_matches!(parse_emit("={}"), Err(_));
    }

    #[test]
    fn cli_parses_repeated_flags() {
        let cli = Cli::try_parse_from([
            "campuslink",
            "--token",
            "t",
            "--subscribe",
            "order:updated",
            "--subscribe",
            "chat:message",
            "--emit",
            "cart:add={}",
        ])
        .unwrap();
        assert_eq!(cli.subscriptions, vec!["order:updated", "chat:message"]);
        assert_eq!(cli.emits.len(), 1);
    }

    #[test]
    fn cli_overrides_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"serverUrl": "ws://file.example/rt"}"#).unwrap();

        let cli = Cli::try_parse_from([
            "campuslink",
            "--token",
            "t",
            "--settings",
            path.to_str().unwrap(),
            "--log-level",
            "debug",
        ])
        .unwrap();
        let settings = cli.load_settings().unwrap();
        assert_eq!(settings.server_url, "ws://file.example/rt");
        assert_eq!(settings.logging.level, "debug");

        let cli = Cli::try_parse_from([
            "campuslink",
            "--token",
            "t",
            "--settings",
            path.to_str().unwrap(),
            "--server-url",
            "ws://flag.example/rt",
        ])
        .unwrap();
        assert_eq!(cli.load_settings().unwrap().server_url, "ws://flag.example/rt");
    }

    #[test]
    fn cli_overrides_are_validated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{}").unwrap();

        let cli = Cli::try_parse_from([
            "campuslink",
            "--token",
            "t",
            "--settings",
            path.to_str().unwrap(),
            "--server-url",
            "  ",
        ])
        .unwrap();
        let error = cli.load_settings().unwrap_err();
        assert!(format!("{error:#}").contains("serverUrl must not be empty"));
    }

    #[test]
    fn state_line_carries_indicator_label() {
        let line = state_line(&ConnectionSnapshot::default());
        assert_eq!(line["kind"], "state");
        assert_eq!(line["label"], "Offline");
        assert_eq!(line["snapshot"]["state"], "idle");
    }
}
