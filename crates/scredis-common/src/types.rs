//! Domain primitive types used across the scredis workspace.

use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{LEASE_MAX, LEASE_MIN, POOL_SLOTS};
use crate::error::{Result, ScredisError};

/// Host identifier of a leased address, always in `[2, 254]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct LeaseId(u8);

impl LeaseId {
    /// Creates a lease id, rejecting values outside the leasable range.
    ///
    /// # Errors
    ///
    /// Returns [`ScredisError::InvalidAddress`] if `id` is not in `[2, 254]`.
    pub fn new(id: u32) -> Result<Self> {
        match u8::try_from(id) {
            Ok(id) if (LEASE_MIN..=LEASE_MAX).contains(&id) => Ok(Self(id)),
            _ => Err(ScredisError::InvalidAddress {
                address: id.to_string(),
                reason: format!("host id must be in [{LEASE_MIN}, {LEASE_MAX}]"),
            }),
        }
    }

    /// Returns the lease id for a pool slot index.
    ///
    /// Returns `None` for indices past the end of the pool.
    #[must_use]
    pub fn from_slot(slot: usize) -> Option<Self> {
        (slot < POOL_SLOTS).then(|| {
            #[allow(clippy::cast_possible_truncation)]
            let id = slot as u8 + LEASE_MIN;
            Self(id)
        })
    }

    /// Returns the pool slot index backing this id.
    #[must_use]
    pub const fn slot(self) -> usize {
        (self.0 - LEASE_MIN) as usize
    }

    /// Returns the raw host identifier.
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Combines this id with the network part of `network`.
    #[must_use]
    pub const fn address_in(self, network: Ipv4Addr) -> Ipv4Addr {
        let [a, b, c, _] = network.octets();
        Ipv4Addr::new(a, b, c, self.0)
    }
}

impl TryFrom<u32> for LeaseId {
    type Error = ScredisError;

    fn try_from(value: u32) -> Result<Self> {
        Self::new(value)
    }
}

impl From<LeaseId> for u32 {
    fn from(id: LeaseId) -> Self {
        Self::from(id.0)
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An address lease owned by one running container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpLease {
    /// Leased host identifier.
    pub id: LeaseId,
    /// When the lease was taken.
    pub acquired_at: DateTime<Utc>,
}

impl IpLease {
    /// Creates a lease stamped with the current time.
    #[must_use]
    pub fn now(id: LeaseId) -> Self {
        Self {
            id,
            acquired_at: Utc::now(),
        }
    }
}

/// Lifecycle stage of a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LaunchStage {
    /// Root filesystem is being prepared.
    Preparing,
    /// Bridge is up and an address is leased.
    NetworkReady,
    /// Container specification is written.
    SpecReady,
    /// The runtime created the container and its init process.
    RuntimeCreated,
    /// The workload is running.
    Running,
    /// The workload exited and teardown ran.
    Exited,
    /// The launch failed; everything acquired was rolled back.
    Failed,
}

impl LaunchStage {
    /// Returns whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Exited | Self::Failed)
    }
}

impl fmt::Display for LaunchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Preparing => write!(f, "preparing"),
            Self::NetworkReady => write!(f, "network-ready"),
            Self::SpecReady => write!(f, "spec-ready"),
            Self::RuntimeCreated => write!(f, "runtime-created"),
            Self::Running => write!(f, "running"),
            Self::Exited => write!(f, "exited"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_id_accepts_range_bounds() {
        assert_eq!(LeaseId::new(2).unwrap().get(), 2);
        assert_eq!(LeaseId::new(254).unwrap().get(), 254);
    }

    #[test]
    fn lease_id_rejects_reserved_ids() {
        for id in [0, 1, 255, 256, 1000] {
            assert!(LeaseId::new(id).is_err(), "{id} should be rejected");
        }
    }

    #[test]
    fn slot_mapping_covers_whole_pool() {
        assert_eq!(LeaseId::from_slot(0).unwrap().get(), LEASE_MIN);
        assert_eq!(LeaseId::from_slot(POOL_SLOTS - 1).unwrap().get(), LEASE_MAX);
        assert!(LeaseId::from_slot(POOL_SLOTS).is_none());
        assert_eq!(LeaseId::new(22).unwrap().slot(), 20);
    }

    #[test]
    fn address_in_replaces_host_part() {
        let id = LeaseId::new(22).unwrap();
        assert_eq!(
            id.address_in(Ipv4Addr::new(10, 0, 5, 0)),
            Ipv4Addr::new(10, 0, 5, 22)
        );
    }

    #[test]
    fn lease_id_deserializes_with_validation() {
        let ids: Vec<LeaseId> = serde_json::from_str("[2, 22, 254]").unwrap();
        assert_eq!(ids.len(), 3);
        assert!(serde_json::from_str::<Vec<LeaseId>>("[1]").is_err());
    }

    #[test]
    fn terminal_stages() {
        assert!(LaunchStage::Exited.is_terminal());
        assert!(LaunchStage::Failed.is_terminal());
        assert!(!LaunchStage::Running.is_terminal());
        assert_eq!(LaunchStage::NetworkReady.to_string(), "network-ready");
    }
}
