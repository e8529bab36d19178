use super::{Bus, BusMessage, BusStream};
use crate::error::{HubError, HubResult};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

const CHANNEL_CAPACITY: usize = 1024;

/// In-process [`Bus`].
///
/// Several hubs sharing one `MemoryBus` behave like several instances on
/// one Redis. [`MemoryBus::set_available`] simulates an outage: while off,
/// every operation fails and nothing is delivered.
pub struct MemoryBus {
    tx: broadcast::Sender<BusMessage>,
    sets: Mutex<HashMap<String, ExpiringSet>>,
    available: AtomicBool,
}

struct ExpiringSet {
    members: HashSet<String>,
    expires_at: Instant,
}

impl MemoryBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            sets: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> HubResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(HubError::BusUnavailable("memory bus switched off".into()))
        }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

fn channel_matches(channel: &str, channels: &[String], patterns: &[String]) -> bool {
    channels.iter().any(|c| c == channel)
        || patterns.iter().any(|p| match p.strip_suffix('*') {
            Some(prefix) => channel.starts_with(prefix),
            None => p == channel,
        })
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, channel: &str, payload: &str) -> HubResult<()> {
        self.ensure_available()?;
        // no receivers is not an error for pub/sub
        let _ = self.tx.send(BusMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn subscribe(&self, channels: &[&str], patterns: &[&str]) -> HubResult<BusStream> {
        self.ensure_available()?;
        let channels: Vec<String> = channels.iter().map(|c| c.to_string()).collect();
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();

        let stream = BroadcastStream::new(self.tx.subscribe())
            .filter_map(move |item| {
                let matched = match item {
                    Ok(msg) if channel_matches(&msg.channel, &channels, &patterns) => Some(msg),
                    Ok(_) => None,
                    Err(lagged) => {
                        tracing::warn!(error = %lagged, "memory bus subscriber lagged");
                        None
                    }
                };
                futures::future::ready(matched)
            })
            .boxed();
        Ok(stream)
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> HubResult<()> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut sets = self.sets.lock();
        let set = sets.entry(key.to_string()).or_insert_with(|| ExpiringSet {
            members: HashSet::new(),
            expires_at: now,
        });
        if set.expires_at <= now {
            set.members.clear();
        }
        set.members.insert(member.to_string());
        set.expires_at = now + ttl;
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> HubResult<()> {
        self.ensure_available()?;
        let mut sets = self.sets.lock();
        if let Some(set) = sets.get_mut(key) {
            set.members.remove(member);
            if set.members.is_empty() {
                sets.remove(key);
            }
        }
        Ok(())
    }

    async fn set_contains(&self, key: &str, members: &[String]) -> HubResult<Vec<bool>> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut sets = self.sets.lock();
        if sets.get(key).is_some_and(|set| set.expires_at <= now) {
            sets.remove(key);
        }
        let set = sets.get(key);
        Ok(members
            .iter()
            .map(|m| set.is_some_and(|s| s.members.contains(m)))
            .collect())
    }
}
