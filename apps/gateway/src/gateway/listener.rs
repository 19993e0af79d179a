//! Bus listener: the one per-process subscription that feeds the registry.
//!
//! Each pattern runs its own loop: subscribe, deliver every received event
//! to local subscribers, and on any subscription loss wait out an
//! exponential backoff before resubscribing. The loop never gives up.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::bus::{Bus, BusMessage, GROUP_PATTERN, TYPING_PATTERN};
use super::events::ChatEvent;
use super::registry::ConnectionRegistry;

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Doubling delay, capped, reset after a successful receive.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    initial: Duration,
    max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_BACKOFF, MAX_BACKOFF)
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            initial,
            max,
        }
    }

    /// The delay to wait now; the following one doubles up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Connecting,
    Connected,
    Reconnecting { delay: Duration },
}

struct Subscription {
    pattern: &'static str,
    state: Arc<watch::Sender<ListenerState>>,
}

pub struct BusListener {
    bus: Arc<dyn Bus>,
    registry: Arc<ConnectionRegistry>,
    subscriptions: Vec<Subscription>,
    tasks: Mutex<Option<Vec<JoinHandle<()>>>>,
}

impl BusListener {
    /// Listener for group messages and typing indicators.
    pub fn new(bus: Arc<dyn Bus>, registry: Arc<ConnectionRegistry>) -> Self {
        Self::with_patterns(bus, registry, &[GROUP_PATTERN, TYPING_PATTERN])
    }

    pub fn with_patterns(
        bus: Arc<dyn Bus>,
        registry: Arc<ConnectionRegistry>,
        patterns: &[&'static str],
    ) -> Self {
        let subscriptions = patterns
            .iter()
            .map(|&pattern| Subscription {
                pattern,
                state: Arc::new(watch::Sender::new(ListenerState::Stopped)),
            })
            .collect();
        Self {
            bus,
            registry,
            subscriptions,
            tasks: Mutex::new(None),
        }
    }

    /// Start the subscription loops. Only the first call in the process
    /// starts anything; later calls return `false`.
    pub fn start(&self) -> bool {
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            return false;
        }

        let handles = self
            .subscriptions
            .iter()
            .map(|sub| {
                sub.state.send_replace(ListenerState::Connecting);
                tokio::spawn(run_subscription(
                    self.bus.clone(),
                    self.registry.clone(),
                    sub.pattern,
                    sub.state.clone(),
                ))
            })
            .collect();
        *tasks = Some(handles);
        tracing::info!(patterns = ?self.patterns(), "bus listener started");
        true
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().is_some()
    }

    pub fn patterns(&self) -> Vec<&'static str> {
        self.subscriptions.iter().map(|s| s.pattern).collect()
    }

    pub fn state(&self, pattern: &str) -> Option<ListenerState> {
        self.subscriptions
            .iter()
            .find(|s| s.pattern == pattern)
            .map(|s| *s.state.borrow())
    }

    pub fn watch_state(&self, pattern: &str) -> Option<watch::Receiver<ListenerState>> {
        self.subscriptions
            .iter()
            .find(|s| s.pattern == pattern)
            .map(|s| s.state.subscribe())
    }

    /// Resolves once every pattern subscription is established.
    pub async fn wait_until_connected(&self) {
        for sub in &self.subscriptions {
            let mut rx = sub.state.subscribe();
            let _ = rx.wait_for(|s| *s == ListenerState::Connected).await;
        }
    }

    /// Abort the loops. The listener may be started again afterwards.
    pub fn shutdown(&self) {
        if let Some(handles) = self.tasks.lock().take() {
            for handle in handles {
                handle.abort();
            }
            for sub in &self.subscriptions {
                sub.state.send_replace(ListenerState::Stopped);
            }
            tracing::info!("bus listener stopped");
        }
    }
}

impl Drop for BusListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_subscription(
    bus: Arc<dyn Bus>,
    registry: Arc<ConnectionRegistry>,
    pattern: &'static str,
    state: Arc<watch::Sender<ListenerState>>,
) {
    let mut backoff = Backoff::default();
    loop {
        match bus.psubscribe(pattern).await {
            Ok(mut stream) => {
                state.send_replace(ListenerState::Connected);
                tracing::info!(pattern, "bus subscription established");

                while let Some(item) = stream.next().await {
                    match item {
                        Ok(message) => {
                            backoff.reset();
                            deliver(&registry, &message);
                        }
                        Err(err) => {
                            tracing::warn!(pattern, error = %err, "bus subscription failed");
                            break;
                        }
                    }
                }
                tracing::warn!(pattern, "bus subscription lost");
            }
            Err(err) => {
                tracing::warn!(pattern, error = %err, "bus subscribe failed");
            }
        }

        let delay = backoff.next_delay();
        state.send_replace(ListenerState::Reconnecting { delay });
        tracing::info!(pattern, delay_secs = delay.as_secs(), "reconnecting to bus");
        tokio::time::sleep(delay).await;
        state.send_replace(ListenerState::Connecting);
    }
}

fn deliver(registry: &ConnectionRegistry, message: &BusMessage) {
    let event: ChatEvent = match serde_json::from_slice(&message.payload) {
        Ok(event) => event,
        Err(err) => {
            tracing::warn!(channel = %message.channel, error = %err, "dropping malformed bus event");
            return;
        }
    };
    if event.group_id.trim().is_empty() {
        tracing::warn!(channel = %message.channel, "dropping bus event without group_id");
        return;
    }
    if event.channel() != message.channel {
        tracing::warn!(
            channel = %message.channel,
            group_id = %event.group_id,
            "dropping bus event published on another group's channel"
        );
        return;
    }

    let report = registry.fan_out(&event);
    tracing::trace!(
        group_id = %event.group_id,
        delivered = report.delivered,
        failed = report.failed,
        "fanned out bus event"
    );
}
