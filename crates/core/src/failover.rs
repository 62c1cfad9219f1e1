//! Failover phase machine and primary-loss debouncing.
//!
//! The phase is persisted in the cluster status so that a restarted
//! controller resumes where the previous one stopped. Transitions are driven
//! by the operator; this module only decides which ones are legal and when a
//! failing primary has been failing long enough to count as lost.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Externally visible state of a cluster's replication topology.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterPhase {
    /// No instance has been verified as primary yet.
    #[default]
    Bootstrapping,
    /// Primary ready and serving, standbys converged.
    Healthy,
    /// Designated primary unready beyond the grace window.
    PrimaryLost,
    /// Selecting a standby to promote. Falls back to `Healthy` only if the
    /// designated primary recovers before a successor is committed.
    Electing,
    /// New primary designated; waiting for it to leave recovery.
    Promoting,
    /// Primary healthy; standbys (former primary, replacements) reattaching.
    Rejoining,
}

impl ClusterPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ClusterPhase::Bootstrapping => "Bootstrapping",
            ClusterPhase::Healthy => "Healthy",
            ClusterPhase::PrimaryLost => "PrimaryLost",
            ClusterPhase::Electing => "Electing",
            ClusterPhase::Promoting => "Promoting",
            ClusterPhase::Rejoining => "Rejoining",
        }
    }

    /// Whether moving from `self` to `next` is a legal step.
    pub fn can_transition_to(self, next: ClusterPhase) -> bool {
        use ClusterPhase::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Bootstrapping, Healthy | Rejoining)
                | (Healthy, PrimaryLost | Rejoining)
                | (Rejoining, Healthy | PrimaryLost)
                | (PrimaryLost, Electing | Healthy)
                | (Electing, Promoting | PrimaryLost | Healthy)
                | (Promoting, Healthy | Rejoining | PrimaryLost)
        )
    }

    /// `true` between primary loss and the successor being verified.
    pub fn is_failover_in_progress(self) -> bool {
        matches!(
            self,
            ClusterPhase::PrimaryLost | ClusterPhase::Electing | ClusterPhase::Promoting
        )
    }
}

impl fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "Bootstrapping" => Ok(ClusterPhase::Bootstrapping),
            "Healthy" => Ok(ClusterPhase::Healthy),
            "PrimaryLost" => Ok(ClusterPhase::PrimaryLost),
            "Electing" => Ok(ClusterPhase::Electing),
            "Promoting" => Ok(ClusterPhase::Promoting),
            "Rejoining" => Ok(ClusterPhase::Rejoining),
            other => Err(format!("unknown cluster phase '{other}'")),
        }
    }
}

/// Verdict on the designated primary for one reconcile cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryAssessment {
    Healthy,
    /// Unready, but still within the grace window.
    Suspect {
        since: DateTime<Utc>,
        remaining: Duration,
    },
    /// Unready for at least the grace window.
    Lost { since: DateTime<Utc> },
}

/// Debounce a primary readiness observation.
///
/// `failing_since` is the persisted timestamp of the first unready
/// observation; `None` means the primary was healthy last time we looked.
pub fn assess_primary(
    healthy: bool,
    failing_since: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    grace: Duration,
) -> PrimaryAssessment {
    if healthy {
        return PrimaryAssessment::Healthy;
    }
    let since = failing_since.unwrap_or(now);
    let elapsed = (now - since).to_std().unwrap_or(Duration::ZERO);
    if elapsed >= grace {
        PrimaryAssessment::Lost { since }
    } else {
        PrimaryAssessment::Suspect {
            since,
            remaining: grace - elapsed,
        }
    }
}

/// `true` once a failover that began at `since` has exceeded `timeout`.
pub fn failover_stalled(since: DateTime<Utc>, now: DateTime<Utc>, timeout: Duration) -> bool {
    (now - since).to_std().map(|e| e >= timeout).unwrap_or(false)
}
