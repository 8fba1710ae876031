// Startup wiring for the hub service: seed replay, failure forwarding, input bridging.
use anyhow::{Context, Result};
use herald_bridge::{StopWatching, bridge, drain_values};
use herald_hub::{Hub, HubEvent, Order, Query, Reply, SubscriptionGuard};
use serde_json::{Value, json};
use std::fs;
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::ServiceConfig;

// Lines buffered between the reader thread and the bridge task.
const INPUT_BUFFER: usize = 64;

pub struct Service {
    hub: Arc<Hub>,
    config: ServiceConfig,
    watchers: Vec<StopWatching>,
    input: Option<StopWatching>,
    _subscriptions: Vec<SubscriptionGuard>,
}

/// Build the hub and run the startup steps the configuration asks for.
pub async fn start(config: ServiceConfig) -> Result<Service> {
    let hub = Arc::new(Hub::with_config(config.hub_config()?).context("build hub")?);
    let mut watchers = Vec::new();
    let mut subscriptions = Vec::new();

    if let Some(channel) = config.error_channel.clone() {
        let skip = channel.clone();
        // Failures on the error channel itself are not re-published, or a failing
        // listener there would feed itself forever.
        let watcher = bridge(Arc::clone(&hub), &channel, hub.watch_events(), move |event| {
            failure_payload(&event).filter(|payload| payload["channel"] != skip.as_str())
        })
        .context("bridge failure events")?;
        watchers.push(watcher);
        tracing::info!(channel = %channel, "forwarding subscriber failures");
    }

    if let Some(route) = config.log_route.clone() {
        let guard = hub
            .subscribe(route.as_str(), 0, |payload, message, _| {
                tracing::info!(
                    channel = %message.channel(),
                    sequence = message.sequence(),
                    payload = %payload,
                    "message"
                );
                Ok(Reply::from(()))
            })
            .into_guard();
        subscriptions.push(guard);
    }

    if let Some(path) = config.seed_path.clone() {
        let entries = load_seed(&path)?;
        let report = drain_values(&hub, entries).await;
        tracing::info!(
            path = %path.display(),
            published = report.published,
            skipped = report.skipped,
            "seed queue replayed"
        );
    }

    Ok(Service {
        hub,
        config,
        watchers,
        input: None,
        _subscriptions: subscriptions,
    })
}

impl Service {
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Forward stdin lines to the configured input channel. Returns false when none is set.
    pub fn attach_stdin(&mut self) -> Result<bool> {
        self.attach_lines(std::io::BufReader::new(std::io::stdin()))
    }

    pub fn attach_lines<R>(&mut self, reader: R) -> Result<bool>
    where
        R: BufRead + Send + 'static,
    {
        let Some(channel) = self.config.stdin_channel.clone() else {
            return Ok(false);
        };
        let (tx, rx) = mpsc::channel::<String>(INPUT_BUFFER);
        std::thread::Builder::new()
            .name("herald-input".to_string())
            .spawn(move || {
                for line in reader.lines() {
                    let Ok(line) = line else {
                        break;
                    };
                    if tx.blocking_send(line).is_err() {
                        break;
                    }
                }
            })
            .context("spawn input reader")?;
        let watcher = bridge(Arc::clone(&self.hub), &channel, rx, parse_line)
            .with_context(|| format!("bridge input into {channel}"))?;
        self.input = Some(watcher);
        Ok(true)
    }

    /// Wait until the attached input runs dry. Returns how many lines were published.
    pub async fn input_closed(&mut self) -> usize {
        match self.input.take() {
            Some(watcher) => watcher.closed().await,
            None => 0,
        }
    }

    /// The newest `dump_limit` messages on `dump_route`, oldest first, as JSON lines.
    pub fn dump(&self) -> Result<Vec<String>> {
        let mut newest = self.hub.query(
            &Query::new(self.config.dump_route.as_str())
                .order(Order::Desc)
                .limit(self.config.dump_limit),
        );
        newest.reverse();
        newest
            .iter()
            .map(|message| serde_json::to_string(&**message).context("encode message"))
            .collect()
    }

    pub fn shutdown(self) {
        for watcher in &self.watchers {
            watcher.stop();
        }
        if let Some(input) = &self.input {
            input.stop();
        }
        tracing::info!(hub = %self.hub.id(), channels = self.hub.channels().len(), "hub stopped");
    }
}

pub fn load_seed(path: &Path) -> Result<Vec<Value>> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read seed queue: {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| "parse seed queue (expected a JSON array)")
}

// JSON lines become structured payloads; anything else is published as a string.
pub fn parse_line(line: String) -> Option<Value> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string())))
}

pub fn failure_payload(event: &HubEvent) -> Option<Value> {
    match event {
        HubEvent::CallbackFailed(err) => Some(json!({
            "channel": err.channel(),
            "sequence": err.sequence(),
            "subscriber": err.subscriber(),
            "error": err.cause().to_string(),
        })),
    }
}
