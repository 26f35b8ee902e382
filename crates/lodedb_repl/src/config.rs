//! Configuration for a replication site.

use crate::error::{ReplError, ReplResult};
use crate::message::SiteId;
use std::time::Duration;

/// How many clients must acknowledge a commit before the master reports
/// it durable group-wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckPolicy {
    /// Do not wait for clients.
    #[default]
    None,
    /// At least one client.
    One,
    /// Enough clients that, with the master, a majority of the group holds
    /// the commit.
    Quorum,
    /// Every other site.
    All,
}

impl AckPolicy {
    /// Client acknowledgements needed in a group of `nsites`.
    pub fn required(self, nsites: usize) -> usize {
        let clients = nsites.saturating_sub(1);
        match self {
            AckPolicy::None => 0,
            AckPolicy::One => clients.min(1),
            AckPolicy::Quorum => (nsites / 2 + 1).saturating_sub(1),
            AckPolicy::All => clients,
        }
    }
}

/// Configuration of one replication site.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// This site's id, unique in the group.
    pub site_id: SiteId,
    /// Number of sites in the group, this one included.
    pub nsites: usize,
    /// Election priority. Sites with priority 0 never become master.
    pub priority: u32,
    /// Acknowledgement policy for commits on the master.
    pub ack_policy: AckPolicy,
    /// How long a master commit waits for acknowledgements.
    pub ack_timeout: Duration,
    /// How long an election collects votes before it is decided.
    pub election_timeout: Duration,
    /// How long a client waits for local transactions before it rolls
    /// its log back to match a new master.
    pub rollback_wait: Duration,
    /// Records per message batch when answering a log request.
    pub request_batch: usize,
    /// Receive poll interval of the message loop.
    pub poll_interval: Duration,
}

impl ReplicationConfig {
    /// Creates a configuration for site `site_id` in a group of `nsites`.
    pub fn new(site_id: SiteId, nsites: usize) -> Self {
        Self {
            site_id,
            nsites,
            priority: 100,
            ack_policy: AckPolicy::None,
            ack_timeout: Duration::from_secs(1),
            election_timeout: Duration::from_secs(2),
            rollback_wait: Duration::from_secs(5),
            request_batch: 256,
            poll_interval: Duration::from_millis(20),
        }
    }

    /// Sets the election priority.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the acknowledgement policy.
    pub fn with_ack_policy(mut self, policy: AckPolicy) -> Self {
        self.ack_policy = policy;
        self
    }

    /// Sets the acknowledgement timeout.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Sets the election timeout.
    pub fn with_election_timeout(mut self, timeout: Duration) -> Self {
        self.election_timeout = timeout;
        self
    }

    /// Sets how long a rollback waits for local transactions.
    pub fn with_rollback_wait(mut self, wait: Duration) -> Self {
        self.rollback_wait = wait;
        self
    }

    /// Sets the batch size for log requests.
    pub fn with_request_batch(mut self, records: usize) -> Self {
        self.request_batch = records;
        self
    }

    /// Votes needed to win an election.
    pub fn majority(&self) -> usize {
        self.nsites / 2 + 1
    }

    /// Checks the configuration.
    ///
    /// # Errors
    ///
    /// `ReplError::Config` for an empty group or a zero batch size.
    pub fn validate(&self) -> ReplResult<()> {
        if self.nsites == 0 {
            return Err(ReplError::Config("a group needs at least one site".into()));
        }
        if self.request_batch == 0 {
            return Err(ReplError::Config("request_batch must be positive".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(ReplError::Config("poll_interval must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_pattern() {
        let config = ReplicationConfig::new(3, 5)
            .with_priority(0)
            .with_ack_policy(AckPolicy::Quorum)
            .with_ack_timeout(Duration::from_millis(250));
        assert_eq!(config.site_id, 3);
        assert_eq!(config.priority, 0);
        assert_eq!(config.ack_policy, AckPolicy::Quorum);
        assert_eq!(config.ack_timeout, Duration::from_millis(250));
        assert_eq!(config.majority(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn ack_requirements() {
        assert_eq!(AckPolicy::None.required(5), 0);
        assert_eq!(AckPolicy::One.required(5), 1);
        assert_eq!(AckPolicy::One.required(1), 0);
        assert_eq!(AckPolicy::Quorum.required(3), 1);
        assert_eq!(AckPolicy::Quorum.required(4), 2);
        assert_eq!(AckPolicy::Quorum.required(5), 2);
        assert_eq!(AckPolicy::All.required(5), 4);
    }

    #[test]
    fn invalid_configs() {
        assert!(ReplicationConfig::new(1, 0).validate().is_err());
        assert!(ReplicationConfig::new(1, 3)
            .with_request_batch(0)
            .validate()
            .is_err());
    }
}
