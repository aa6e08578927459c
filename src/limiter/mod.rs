//! Rate Limit Engine - admission decisions derived from the query log
//!
//! There are no counters or timers here: every decision is recomputed from the provider's
//! logged calls and the current instant, so the engine is stateless and freely shared
//! between provider tasks.
//!
//! Rules are evaluated in declaration order and the first denying rule wins. A rule denies
//! when its window already holds `quota` calls, or when a call in the window carries the
//! rule's trigger signature (provider-declared cooldown). Per-second rules are the
//! exception to the quota check: they delay the caller until the window frees up and then
//! pass.

pub mod windows;

use crate::providers::rules::{RateLimitRule, WindowKind};
use crate::store::db::StoreError;
use crate::store::query_log::{QueryLogEntry, QueryLogStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use windows::{ObservationWindow, ZoneSetting};

/// Outcome of one rule against one window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Pass,
    /// Burst limit reached; wait until the instant, then pass
    Throttle(DateTime<Utc>),
    QuotaExhausted,
    Cooldown,
}

/// Result of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied,
    /// Cancellation interrupted a throttle wait before a decision was reached
    Cancelled,
}

/// Per-rule quota usage at an instant
#[derive(Debug, Clone)]
pub struct RuleUsage {
    pub rule: RateLimitRule,
    pub window: ObservationWindow,
    pub count: usize,
    /// A logged call in the window carries the rule's trigger signature
    pub trigger_hit: bool,
}

impl RuleUsage {
    pub fn remaining(&self) -> usize {
        (self.rule.quota as usize).saturating_sub(self.count)
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0 || self.trigger_hit
    }
}

#[derive(Clone)]
pub struct RateLimitEngine {
    log: Arc<dyn QueryLogStore>,
    zone: ZoneSetting,
}

impl RateLimitEngine {
    /// `zone` aligns absolute windows (start of day, start of month, ...)
    pub fn new(log: Arc<dyn QueryLogStore>, zone: ZoneSetting) -> Self {
        Self { log, zone }
    }

    pub fn zone(&self) -> ZoneSetting {
        self.zone
    }

    /// True if any rule currently denies a call to `provider_id`
    ///
    /// May sleep for per-second rules (at most one second per rule).
    pub async fn is_blocked(
        &self,
        provider_id: &str,
        rules: &[RateLimitRule],
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.is_blocked_with_cancel(provider_id, rules, now, &CancellationToken::new())
            .await
    }

    /// Like `is_blocked`, but a throttle wait ends early when `cancel` fires; the pair is
    /// then reported blocked so no new call starts.
    pub async fn is_blocked_with_cancel(
        &self,
        provider_id: &str,
        rules: &[RateLimitRule],
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<bool, StoreError> {
        let admission = self.admit(provider_id, rules, now, cancel).await?;
        Ok(admission != Admission::Allowed)
    }

    /// Admission decision that tells a limiter denial apart from an interrupted wait
    pub async fn admit(
        &self,
        provider_id: &str,
        rules: &[RateLimitRule],
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Admission, StoreError> {
        if rules.is_empty() {
            return Ok(Admission::Allowed);
        }

        let windows: Vec<ObservationWindow> = rules
            .iter()
            .map(|rule| ObservationWindow::for_rule(rule, now, self.zone))
            .collect();
        let history = self.load_history(provider_id, &windows).await?;

        for (rule, window) in rules.iter().zip(&windows) {
            let in_window = entries_in(&history, window);

            match judge(rule, window, &in_window) {
                Verdict::Pass => continue,
                Verdict::Throttle(wake_at) => {
                    let wait = (wake_at - now)
                        .min(rule.timeframe.rolling_duration())
                        .to_std()
                        .unwrap_or_default();

                    log::info!(
                        "⏳ {} burst limit {} reached, waiting {}ms",
                        provider_id,
                        rule.label(),
                        wait.as_millis()
                    );

                    tokio::select! {
                        _ = cancel.cancelled() => {
                            log::debug!("   └─ {} throttle wait cancelled", provider_id);
                            return Ok(Admission::Cancelled);
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                Verdict::QuotaExhausted => {
                    log::warn!(
                        "🚫 {} limit hit: {} ({} calls in window)",
                        provider_id,
                        rule.label(),
                        in_window.len()
                    );
                    return Ok(Admission::Denied);
                }
                Verdict::Cooldown => {
                    log::warn!(
                        "🚫 {} signalled throttling (status {:?}) within {} window",
                        provider_id,
                        rule.trigger_status_code,
                        rule.label()
                    );
                    return Ok(Admission::Denied);
                }
            }
        }

        Ok(Admission::Allowed)
    }

    /// Window, count and trigger state of every rule at `now`; never sleeps
    pub async fn usage(
        &self,
        provider_id: &str,
        rules: &[RateLimitRule],
        now: DateTime<Utc>,
    ) -> Result<Vec<RuleUsage>, StoreError> {
        let windows: Vec<ObservationWindow> = rules
            .iter()
            .map(|rule| ObservationWindow::for_rule(rule, now, self.zone))
            .collect();
        let history = self.load_history(provider_id, &windows).await?;

        Ok(rules
            .iter()
            .zip(windows)
            .map(|(rule, window)| {
                let in_window = entries_in(&history, &window);
                RuleUsage {
                    rule: rule.clone(),
                    window,
                    count: in_window.len(),
                    trigger_hit: trigger_matches(rule, &in_window),
                }
            })
            .collect())
    }

    /// Entries from the earliest window start onwards
    async fn load_history(
        &self,
        provider_id: &str,
        windows: &[ObservationWindow],
    ) -> Result<Vec<QueryLogEntry>, StoreError> {
        match windows.iter().map(|w| w.start).min() {
            Some(since) => self.log.history_since(provider_id, since).await,
            None => Ok(Vec::new()),
        }
    }
}

fn entries_in<'a>(history: &'a [QueryLogEntry], window: &ObservationWindow) -> Vec<&'a QueryLogEntry> {
    history
        .iter()
        .filter(|entry| window.contains(&entry.timestamp))
        .collect()
}

fn judge(rule: &RateLimitRule, window: &ObservationWindow, in_window: &[&QueryLogEntry]) -> Verdict {
    // A confirmed trigger denies regardless of the count, so check it before any wait
    if trigger_matches(rule, in_window) {
        return Verdict::Cooldown;
    }

    if in_window.len() < rule.quota as usize {
        return Verdict::Pass;
    }

    if !rule.is_throttle() {
        return Verdict::QuotaExhausted;
    }

    let wake_at = match window.kind {
        WindowKind::Rolling => in_window
            .iter()
            .map(|entry| entry.timestamp.with_timezone(&Utc))
            .min()
            .map(|earliest| earliest + rule.timeframe.rolling_duration())
            .unwrap_or(window.end),
        WindowKind::Absolute => window.end,
    };
    Verdict::Throttle(wake_at)
}

/// A status-code match counts only when the error text (if the rule names one) confirms it
fn trigger_matches(rule: &RateLimitRule, in_window: &[&QueryLogEntry]) -> bool {
    let Some(code) = rule.trigger_status_code else {
        return false;
    };

    let mut hits = in_window.iter().filter(|entry| entry.status_code == Some(code)).peekable();
    if hits.peek().is_none() {
        return false;
    }

    match rule.trigger_error_text.as_deref() {
        Some(text) => hits.any(|entry| {
            entry
                .error_text
                .as_deref()
                .map(|logged| logged.contains(text))
                .unwrap_or(false)
        }),
        None => true,
    }
}
