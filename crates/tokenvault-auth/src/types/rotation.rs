//! Refresh credential rotation state.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::clock::to_time_duration;
use crate::crypto::{hash_token, tokens_match};

/// Rotation bookkeeping for one session, stored at `rotation:{session}`.
///
/// `current` and `previous` hold credential hashes. The previous credential
/// stays acceptable for `grace_period` after a rotation so that concurrent
/// refreshes racing on the old value do not fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationState {
    pub current: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<String>,
    pub rotation_count: u64,
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
    #[serde(with = "time::serde::rfc3339")]
    pub last_rotation: OffsetDateTime,
}

impl RotationState {
    /// Starts tracking `token` as the only accepted credential.
    pub fn new(token: &str, grace_period: Duration, now: OffsetDateTime) -> Self {
        Self {
            current: hash_token(token),
            previous: None,
            rotation_count: 0,
            grace_period,
            last_rotation: now,
        }
    }

    /// Returns `true` while the previous credential is still honored.
    pub fn in_grace(&self, now: OffsetDateTime) -> bool {
        now - self.last_rotation < to_time_duration(self.grace_period)
    }

    /// Returns `true` if `token` may be used to refresh at `now`.
    pub fn accepts(&self, token: &str, now: OffsetDateTime) -> bool {
        let presented = hash_token(token);
        let is_current = tokens_match(&self.current, &presented);
        let is_previous = self
            .previous
            .as_deref()
            .is_some_and(|previous| tokens_match(previous, &presented));
        is_current | (is_previous && self.in_grace(now))
    }

    /// Drops the previous credential once the grace period is over.
    ///
    /// Returns `true` if anything changed.
    pub fn prune(&mut self, now: OffsetDateTime) -> bool {
        if self.previous.is_some() && !self.in_grace(now) {
            self.previous = None;
            return true;
        }
        false
    }

    pub fn clear_previous(&mut self) {
        self.previous = None;
    }

    /// Makes `new_token` current and keeps the old one for the grace period.
    pub fn rotate(&mut self, new_token: &str, now: OffsetDateTime) {
        let next = hash_token(new_token);
        self.previous = Some(std::mem::replace(&mut self.current, next));
        self.rotation_count += 1;
        self.last_rotation = now;
    }
}
