use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::EngineError;
use crate::store::{LinkId, Policy, RetryPolicy, SecretRecord, SecretStore, ViewLimit};

/// What the request that uses up the last allowed view gets back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FinalView {
    /// Return the secret, then it is gone.
    #[default]
    Reveal,
    /// Delete the secret and answer not-found.
    Deny,
}

impl FromStr for FinalView {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reveal" => Ok(Self::Reveal),
            "deny" => Ok(Self::Deny),
            other => Err(format!("expected 'reveal' or 'deny', got '{other}'")),
        }
    }
}

/// Creates secrets under a policy and serves them until the policy says stop.
///
/// Holds no mutable state of its own; cloning is cheap and every clone talks to
/// the same store.
#[derive(Clone)]
pub struct SecretLifecycleEngine {
    store: Arc<dyn SecretStore>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    final_view: FinalView,
}

impl SecretLifecycleEngine {
    pub fn new(store: Arc<dyn SecretStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            retry: RetryPolicy::default(),
            final_view: FinalView::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_final_view(mut self, final_view: FinalView) -> Self {
        self.final_view = final_view;
        self
    }

    /// Store `secret` under `policy` and return the id for its link.
    pub fn create(&self, secret: &str, policy: Policy) -> Result<LinkId, EngineError> {
        let id = LinkId::generate();
        let record = SecretRecord::new(secret.to_owned(), self.clock.now(), policy);
        self.store.insert(&id, &record)?;

        if let Some(ttl) = record.policy.ttl() {
            // The caller never sees the id on failure, so nothing could ever
            // consume or age out the record.
            if let Err(e) = self.store.expire_after(&id, ttl) {
                warn!(link_id = %id, error = %e, "could not set TTL, removing secret");
                self.store.delete(&id)?;
                return Err(e.into());
            }
        }

        info!(
            link_id = %id,
            max_views = ?record.policy.max_views,
            max_age_days = ?record.policy.max_age_days,
            ip_restricted = record.policy.restrict_to_ip.is_some(),
            "secret created"
        );
        Ok(id)
    }

    /// Count a view against `id` and return the secret if the policy still allows it.
    ///
    /// Every failure (unknown, expired, over-viewed, wrong address) is
    /// [`EngineError::NotFound`].
    pub fn consume(&self, id: &LinkId, requestor: &str) -> Result<String, EngineError> {
        if self.store.get(id)?.is_none() {
            debug!(link_id = %id, "consume: unknown link");
            return Err(EngineError::NotFound);
        }

        // The increment hands back the record as of this caller's own view, so
        // the limit check sees this caller's count even if others have moved on.
        let Some(mut record) = self.store.increment_views(id, &self.retry)? else {
            debug!(link_id = %id, "consume: removed before increment");
            return Err(EngineError::NotFound);
        };
        let views = record.view_count;

        let aged_out = record.policy.is_aged_out(record.created_at, self.clock.now());
        match record.policy.view_limit(views) {
            ViewLimit::Under if aged_out => {
                self.store.delete(id)?;
                info!(link_id = %id, views, "secret expired by age");
                return Err(EngineError::NotFound);
            }
            ViewLimit::Under => {}
            ViewLimit::Reached => {
                self.store.delete(id)?;
                info!(link_id = %id, views, "secret burned after final view");
                if aged_out || self.final_view == FinalView::Deny {
                    return Err(EngineError::NotFound);
                }
            }
            ViewLimit::Exceeded => {
                self.store.delete(id)?;
                debug!(link_id = %id, views, "consume: view limit already passed");
                return Err(EngineError::NotFound);
            }
        }

        if !record.policy.permits(requestor) {
            debug!(link_id = %id, requestor, "consume: address not permitted");
            return Err(EngineError::NotFound);
        }

        Ok(std::mem::take(&mut record.secret))
    }
}
