//! Change notification shared by both store backends.
//!
//! A subscription is fed from two sides: the owning store publishes its own
//! writes immediately, and a polling task re-reads the key at a fixed interval
//! to pick up writes from other processes. Each subscriber remembers a
//! fingerprint of the last value it saw, so a change is delivered once no
//! matter which side notices it first.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Callback invoked with the new value (`None` when the key disappeared).
pub type WatchCallback = Arc<dyn Fn(Option<Value>) + Send + Sync>;

/// Reads the current value of a watched key for the poller.
pub type WatchReader = Box<dyn Fn() -> anyhow::Result<Option<Value>> + Send + Sync>;

struct Subscriber {
    key: String,
    callback: WatchCallback,
    last_seen: Mutex<Option<String>>,
}

impl Subscriber {
    fn deliver(&self, value: Option<&Value>) {
        let fingerprint = value.map(|v| v.to_string());
        {
            let Ok(mut last) = self.last_seen.lock() else {
                return;
            };
            if *last == fingerprint {
                return;
            }
            *last = fingerprint;
        }
        (self.callback)(value.cloned());
    }
}

/// Registry of watch subscriptions for one store instance.
#[derive(Default)]
pub struct WatchHub {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<u64, Arc<Subscriber>>>,
}

impl WatchHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a subscription and start its poller.
    ///
    /// `initial` is the value at subscription time; only later changes are
    /// delivered. The poller stops when `reader` fails or the subscription ends.
    pub fn subscribe(
        self: &Arc<Self>,
        key: &str,
        initial: Option<&Value>,
        callback: WatchCallback,
        reader: WatchReader,
        poll_interval: Duration,
    ) -> WatchHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Arc::new(Subscriber {
            key: key.to_string(),
            callback,
            last_seen: Mutex::new(initial.map(|v| v.to_string())),
        });

        if let Ok(mut subs) = self.subscribers.lock() {
            subs.insert(id, Arc::clone(&subscriber));
        }

        let weak_sub = Arc::downgrade(&subscriber);
        let poller = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(sub) = weak_sub.upgrade() else {
                    break;
                };
                match reader() {
                    Ok(value) => sub.deliver(value.as_ref()),
                    Err(e) => {
                        debug!(key = %sub.key, error = %e, "Watch poll failed, stopping notifications");
                        break;
                    }
                }
            }
        });

        WatchHandle {
            hub: Arc::downgrade(self),
            id,
            poller: Some(poller),
        }
    }

    /// Deliver a locally written value to subscribers of `key`.
    pub fn publish(&self, key: &str, value: Option<&Value>) {
        let targets: Vec<Arc<Subscriber>> = match self.subscribers.lock() {
            Ok(subs) => subs.values().filter(|s| s.key == key).cloned().collect(),
            Err(_) => return,
        };
        for sub in targets {
            sub.deliver(value);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }

    fn remove(&self, id: u64) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.remove(&id);
        }
    }
}

/// Handle to an active watch. Dropping it unsubscribes.
pub struct WatchHandle {
    hub: Weak<WatchHub>,
    id: u64,
    poller: Option<JoinHandle<()>>,
}

impl WatchHandle {
    /// Stop receiving notifications.
    pub fn unsubscribe(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.id);
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
