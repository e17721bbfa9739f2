//! Dialogs, presence watchers and buddy subscriptions for one session.

use ahash::AHashMap;
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::debug;

/// Expiry requested on outbound presence subscriptions.
pub const SUBSCRIBE_EXPIRES: u32 = 1200;
/// Outbound subscriptions are refreshed this long after being sent,
/// plus up to `RESUBSCRIBE_JITTER_SECS`.
pub const RESUBSCRIBE_AFTER_SECS: u64 = 1140;
pub const RESUBSCRIBE_JITTER_SECS: u64 = 50;
/// Watcher lifetime when the SUBSCRIBE carried no Expires.
pub const DEFAULT_WATCHER_EXPIRES: u32 = 600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dialog {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: Option<String>,
}

/// A remote party subscribed to our presence.
#[derive(Debug, Clone)]
pub struct Watcher {
    pub name: String,
    pub dialog: Dialog,
    /// Legacy client that only understands `application/xpidf+xml`.
    pub needs_xpidf: bool,
    pub expires_at: Instant,
}

#[derive(Debug, Clone)]
pub struct Buddy {
    pub name: String,
    pub resubscribe_at: Option<Instant>,
}

impl Buddy {
    fn is_due(&self, now: Instant) -> bool {
        self.resubscribe_at.map_or(true, |at| at <= now)
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ResubscribePlan {
    pub resubscribe: Vec<String>,
    pub expired_watchers: Vec<String>,
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    watchers: AHashMap<String, Watcher>,
    buddies: AHashMap<String, Buddy>,
}

fn buddy_key(name: &str) -> String {
    name.to_lowercase()
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find-or-create. A repeated SUBSCRIBE in the same dialog refreshes
    /// the entry and completes the remote tag; one carrying a new Call-ID
    /// replaces the dialog.
    pub fn create_watcher(
        &mut self,
        name: &str,
        call_id: &str,
        our_tag: &str,
        their_tag: Option<&str>,
        needs_xpidf: bool,
        expires_at: Instant,
    ) -> &Watcher {
        let dialog = Dialog {
            call_id: call_id.to_string(),
            local_tag: our_tag.to_string(),
            remote_tag: their_tag.map(str::to_string),
        };

        let watcher = self
            .watchers
            .entry(name.to_string())
            .and_modify(|existing| {
                if existing.dialog.call_id == call_id {
                    if existing.dialog.remote_tag.is_none() {
                        existing.dialog.remote_tag = their_tag.map(str::to_string);
                    }
                } else {
                    debug!("Watcher {} opened a new dialog {}", name, call_id);
                    existing.dialog = dialog.clone();
                }
                existing.needs_xpidf = needs_xpidf;
                existing.expires_at = expires_at;
            })
            .or_insert_with(|| {
                debug!("New watcher {}", name);
                Watcher {
                    name: name.to_string(),
                    dialog,
                    needs_xpidf,
                    expires_at,
                }
            });
        watcher
    }

    pub fn remove_watcher(&mut self, name: &str) -> Option<Watcher> {
        self.watchers.remove(name)
    }

    pub fn watcher(&self, name: &str) -> Option<&Watcher> {
        self.watchers.get(name)
    }

    pub fn watchers(&self) -> impl Iterator<Item = &Watcher> {
        self.watchers.values()
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    /// Returns true if the buddy was not tracked yet.
    pub fn add_buddy(&mut self, name: &str) -> bool {
        let key = buddy_key(name);
        if self.buddies.contains_key(&key) {
            return false;
        }
        self.buddies.insert(
            key,
            Buddy {
                name: name.to_string(),
                resubscribe_at: None,
            },
        );
        true
    }

    pub fn remove_buddy(&mut self, name: &str) -> Option<Buddy> {
        self.buddies.remove(&buddy_key(name))
    }

    pub fn buddy(&self, name: &str) -> Option<&Buddy> {
        self.buddies.get(&buddy_key(name))
    }

    pub fn buddies(&self) -> impl Iterator<Item = &Buddy> {
        self.buddies.values()
    }

    /// Records that a SUBSCRIBE was just sent to `name`.
    pub fn schedule_resubscribe(&mut self, name: &str, now: Instant) {
        if let Some(buddy) = self.buddies.get_mut(&buddy_key(name)) {
            let jitter = rand::thread_rng().gen_range(0..RESUBSCRIBE_JITTER_SECS);
            buddy.resubscribe_at =
                Some(now + Duration::from_secs(RESUBSCRIBE_AFTER_SECS + jitter));
        }
    }

    /// Buddies due for a new SUBSCRIBE, and watchers dropped for expiring.
    pub fn resubscribe_sweep(&mut self, now: Instant) -> ResubscribePlan {
        let mut resubscribe: Vec<String> = self
            .buddies
            .values()
            .filter(|buddy| buddy.is_due(now))
            .map(|buddy| buddy.name.clone())
            .collect();
        resubscribe.sort();

        let mut expired_watchers: Vec<String> = self
            .watchers
            .values()
            .filter(|watcher| watcher.expires_at < now)
            .map(|watcher| watcher.name.clone())
            .collect();
        expired_watchers.sort();
        for name in &expired_watchers {
            debug!("Watcher {} expired", name);
            self.watchers.remove(name);
        }

        ResubscribePlan {
            resubscribe,
            expired_watchers,
        }
    }

    pub fn clear(&mut self) {
        self.watchers.clear();
        self.buddies.clear();
    }
}
