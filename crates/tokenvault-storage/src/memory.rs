//! In-memory key-value backend.
//!
//! Entries live in a sharded [`DashMap`], which gives per-key atomicity for
//! counters, set updates and set-if-absent locking. Expiry is evaluated
//! lazily on every access; [`KvStore::purge_expired`] sweeps the rest.
//!
//! Lock waiters park on a per-lock [`Notify`] and are woken on release, or
//! when the holder's lease runs out, instead of polling.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use serde_json::Value;
use tokio::sync::Notify;

use crate::error::{StorageError, StorageResult};
use crate::pattern::GlobPattern;
use crate::traits::{KvStore, LockToken};

#[derive(Debug, Clone)]
enum Slot {
    Value(Value),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(slot: Slot, ttl: Option<Duration>, now: Instant) -> Self {
        Self {
            slot,
            expires_at: ttl.map(|ttl| now + ttl),
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.expires_at.map(|at| at.saturating_duration_since(now))
    }
}

/// In-memory [`KvStore`] for single-process deployments and tests.
#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    entries: DashMap<String, Entry>,
    lock_waiters: DashMap<String, Arc<Notify>>,
}

impl InMemoryKvStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-expired) keys.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    /// Returns `true` if no live keys are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `f` against the live entry at `key`, dropping it if expired.
    fn with_live<R>(&self, key: &str, f: impl FnOnce(&Entry, Instant) -> R) -> Option<R> {
        let now = Instant::now();
        {
            let entry = self.entries.get(key)?;
            if !entry.is_expired(now) {
                return Some(f(entry.value(), now));
            }
        }
        self.entries.remove_if(key, |_, e| e.is_expired(now));
        None
    }

    fn waiter(&self, name: &str) -> Arc<Notify> {
        Arc::clone(self.lock_waiters.entry(name.to_string()).or_default().value())
    }

    /// Set-if-absent. On contention returns the holder's remaining lease.
    fn try_lock(&self, name: &str, token: &LockToken, ttl: Duration) -> Result<(), Option<Duration>> {
        let now = Instant::now();
        let lease = || {
            Entry::new(
                Slot::Value(Value::String(token.as_str().to_string())),
                Some(ttl),
                now,
            )
        };

        match self.entries.entry(name.to_string()) {
            MapEntry::Vacant(vacant) => {
                vacant.insert(lease());
                Ok(())
            }
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(lease());
                    Ok(())
                } else {
                    Err(occupied.get().remaining(now))
                }
            }
        }
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Value>> {
        self.with_live(key, |entry, _| match &entry.slot {
            Slot::Value(value) => Ok(Some(value.clone())),
            Slot::Set(_) => Err(StorageError::wrong_type(key, "value")),
        })
        .unwrap_or(Ok(None))
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> StorageResult<()> {
        self.entries.insert(
            key.to_string(),
            Entry::new(Slot::Value(value), ttl, Instant::now()),
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired(now)))
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.with_live(key, |_, _| ()).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StorageResult<bool> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> StorageResult<Option<Duration>> {
        Ok(self.with_live(key, |entry, now| entry.remaining(now)).flatten())
    }

    async fn scan(&self, pattern: &str) -> StorageResult<Vec<String>> {
        let glob = GlobPattern::new(pattern)?;
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| !entry.is_expired(now) && glob.matches(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn mget(&self, keys: &[String]) -> StorageResult<Vec<Option<Value>>> {
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            // Sets are reported as missing, matching MGET semantics.
            let value = self
                .with_live(key, |entry, _| match &entry.slot {
                    Slot::Value(value) => Some(value.clone()),
                    Slot::Set(_) => None,
                })
                .flatten();
            values.push(value);
        }
        Ok(values)
    }

    async fn mset(
        &self,
        entries: Vec<(String, Value)>,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        let now = Instant::now();
        for (key, value) in entries {
            self.entries
                .insert(key, Entry::new(Slot::Value(value), ttl, now));
        }
        Ok(())
    }

    async fn incr(&self, key: &str, delta: i64) -> StorageResult<i64> {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Slot::Value(Value::from(0)), None, now));
        if entry.is_expired(now) {
            *entry = Entry::new(Slot::Value(Value::from(0)), None, now);
        }

        match &mut entry.slot {
            Slot::Value(value) => {
                let current = value
                    .as_i64()
                    .ok_or_else(|| StorageError::wrong_type(key, "integer"))?;
                let next = current
                    .checked_add(delta)
                    .ok_or_else(|| StorageError::backend(format!("counter overflow at {key}")))?;
                *value = Value::from(next);
                Ok(next)
            }
            Slot::Set(_) => Err(StorageError::wrong_type(key, "integer")),
        }
    }

    async fn add_to_set(&self, key: &str, member: &str) -> StorageResult<bool> {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Slot::Set(HashSet::new()), None, now));
        if entry.is_expired(now) {
            *entry = Entry::new(Slot::Set(HashSet::new()), None, now);
        }

        match &mut entry.slot {
            Slot::Set(members) => Ok(members.insert(member.to_string())),
            Slot::Value(_) => Err(StorageError::wrong_type(key, "set")),
        }
    }

    async fn remove_from_set(&self, key: &str, member: &str) -> StorageResult<bool> {
        let now = Instant::now();
        let (removed, now_empty) = match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => match &mut entry.slot {
                Slot::Set(members) => (members.remove(member), members.is_empty()),
                Slot::Value(_) => return Err(StorageError::wrong_type(key, "set")),
            },
            _ => (false, false),
        };

        if now_empty {
            self.entries
                .remove_if(key, |_, e| matches!(&e.slot, Slot::Set(m) if m.is_empty()));
        }
        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> StorageResult<Vec<String>> {
        self.with_live(key, |entry, _| match &entry.slot {
            Slot::Set(members) => {
                let mut members: Vec<String> = members.iter().cloned().collect();
                members.sort();
                Ok(members)
            }
            Slot::Value(_) => Err(StorageError::wrong_type(key, "set")),
        })
        .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn lock_acquire(
        &self,
        name: &str,
        ttl: Duration,
        wait: Option<Duration>,
    ) -> StorageResult<Option<LockToken>> {
        let token = LockToken::generate();
        let deadline = wait.map(|wait| Instant::now() + wait);

        loop {
            // Register interest before trying so a release in between is not missed.
            let notify = self.waiter(name);
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let held_for = match self.try_lock(name, &token, ttl) {
                Ok(()) => return Ok(Some(token)),
                Err(held_for) => held_for,
            };

            let Some(deadline) = deadline else {
                return Ok(None);
            };
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let mut sleep_for = deadline - now;
            if let Some(held_for) = held_for {
                sleep_for = sleep_for.min(held_for);
            }
            let _ = tokio::time::timeout(sleep_for, notified).await;
        }
    }

    async fn lock_release(&self, name: &str, token: &LockToken) -> StorageResult<bool> {
        let now = Instant::now();
        let released = self
            .entries
            .remove_if(name, |_, entry| {
                !entry.is_expired(now)
                    && matches!(&entry.slot, Slot::Value(Value::String(held)) if held == token.as_str())
            })
            .is_some();

        if let Some((_, notify)) = self.lock_waiters.remove(name) {
            notify.notify_waiters();
        }
        Ok(released)
    }

    async fn purge_expired(&self) -> StorageResult<u64> {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!(removed, "purged expired in-memory entries");
        }
        Ok(removed as u64)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
