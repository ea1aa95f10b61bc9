use std::fmt;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use zeroize::ZeroizeOnDrop;

pub const SECONDS_PER_DAY: i64 = 86_400;

/// Opaque identifier embedded in a shareable link. 128 random bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(Uuid);

impl LinkId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for LinkId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Raw, unvalidated policy options as they arrive from a request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyInput {
    pub views: Option<u32>,
    pub days: Option<u32>,
    pub ip: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("views must be a positive integer")]
    ZeroViews,
    #[error("days must be a positive integer")]
    ZeroDays,
    #[error("ip is not a valid address: {0}")]
    InvalidIp(String),
}

/// Validity rules attached to a secret at creation. Every field is optional;
/// an empty policy never expires.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub max_views: Option<NonZeroU32>,
    pub max_age_days: Option<NonZeroU32>,
    pub restrict_to_ip: Option<IpAddr>,
}

/// Where a view count stands relative to `max_views`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewLimit {
    Under,
    /// This view is the last one allowed.
    Reached,
    /// Counted past the limit; only possible when an increment raced a delete.
    Exceeded,
}

impl Policy {
    /// Validate boundary input into a policy.
    pub fn from_input(input: &PolicyInput) -> Result<Self, PolicyError> {
        let max_views = match input.views {
            Some(v) => Some(NonZeroU32::new(v).ok_or(PolicyError::ZeroViews)?),
            None => None,
        };
        let max_age_days = match input.days {
            Some(d) => Some(NonZeroU32::new(d).ok_or(PolicyError::ZeroDays)?),
            None => None,
        };
        let restrict_to_ip = match input.ip.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(
                raw.parse::<IpAddr>()
                    .map_err(|_| PolicyError::InvalidIp(raw.to_owned()))?
                    .to_canonical(),
            ),
        };
        Ok(Self {
            max_views,
            max_age_days,
            restrict_to_ip,
        })
    }

    /// Store-level time-to-live backstop, if the policy has an age limit.
    pub fn ttl(&self) -> Option<Duration> {
        self.max_age_days
            .map(|days| Duration::from_secs(u64::from(days.get()) * SECONDS_PER_DAY as u64))
    }

    pub fn view_limit(&self, views: u32) -> ViewLimit {
        match self.max_views.map(NonZeroU32::get) {
            Some(max) if views > max => ViewLimit::Exceeded,
            Some(max) if views == max => ViewLimit::Reached,
            _ => ViewLimit::Under,
        }
    }

    /// True once `now` is strictly past `created_at + max_age_days`.
    pub fn is_aged_out(&self, created_at: i64, now: i64) -> bool {
        match self.max_age_days {
            Some(days) => now > created_at + i64::from(days.get()) * SECONDS_PER_DAY,
            None => false,
        }
    }

    /// Whether `requestor` may read under the address restriction.
    /// Unparseable requestor addresses never match a restriction.
    pub fn permits(&self, requestor: &str) -> bool {
        match self.restrict_to_ip {
            None => true,
            Some(allowed) => requestor
                .trim()
                .parse::<IpAddr>()
                .is_ok_and(|addr| addr.to_canonical() == allowed),
        }
    }
}

/// Stored in the backend keyed by link id.
#[derive(Debug, Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct SecretRecord {
    pub secret: String,
    pub view_count: u32,
    /// Unix timestamp (seconds).
    pub created_at: i64,
    #[zeroize(skip)]
    pub policy: Policy,
}

impl SecretRecord {
    pub fn new(secret: String, created_at: i64, policy: Policy) -> Self {
        Self {
            secret,
            view_count: 0,
            created_at,
            policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(views: Option<u32>, days: Option<u32>, ip: Option<&str>) -> PolicyInput {
        PolicyInput {
            views,
            days,
            ip: ip.map(str::to_owned),
        }
    }

    #[test]
    fn empty_input_is_empty_policy() {
        assert_eq!(Policy::from_input(&input(None, None, None)), Ok(Policy::default()));
        assert_eq!(
            Policy::from_input(&input(None, None, Some("  "))),
            Ok(Policy::default())
        );
    }

    #[test]
    fn rejects_zero_and_bad_ip() {
        assert_eq!(
            Policy::from_input(&input(Some(0), None, None)),
            Err(PolicyError::ZeroViews)
        );
        assert_eq!(
            Policy::from_input(&input(None, Some(0), None)),
            Err(PolicyError::ZeroDays)
        );
        assert!(matches!(
            Policy::from_input(&input(None, None, Some("not-an-ip"))),
            Err(PolicyError::InvalidIp(_))
        ));
    }

    #[test]
    fn view_limit_boundaries() {
        let p = Policy::from_input(&input(Some(3), None, None)).unwrap();
        assert_eq!(p.view_limit(2), ViewLimit::Under);
        assert_eq!(p.view_limit(3), ViewLimit::Reached);
        assert_eq!(p.view_limit(4), ViewLimit::Exceeded);
        assert_eq!(Policy::default().view_limit(u32::MAX), ViewLimit::Under);
    }

    #[test]
    fn age_is_strictly_after_deadline() {
        let p = Policy::from_input(&input(None, Some(1), None)).unwrap();
        assert!(!p.is_aged_out(1_000, 1_000 + SECONDS_PER_DAY));
        assert!(p.is_aged_out(1_000, 1_000 + SECONDS_PER_DAY + 1));
        assert_eq!(p.ttl(), Some(Duration::from_secs(86_400)));
        assert!(!Policy::default().is_aged_out(0, i64::MAX));
    }

    #[test]
    fn ip_restriction_compares_addresses() {
        let p = Policy::from_input(&input(None, None, Some("1.2.3.4"))).unwrap();
        assert!(p.permits("1.2.3.4"));
        assert!(p.permits(" 1.2.3.4 "));
        assert!(p.permits("::ffff:1.2.3.4"));
        assert!(!p.permits("5.6.7.8"));
        assert!(!p.permits("garbage"));
        assert!(Policy::default().permits("anything"));
    }

    #[test]
    fn link_id_round_trips_through_text() {
        let id = LinkId::generate();
        let parsed: LinkId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("nope".parse::<LinkId>().is_err());
        assert_ne!(LinkId::generate(), LinkId::generate());
    }
}
