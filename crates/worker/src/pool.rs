//! Broker availability tracking and round-robin polling order.
//!
//! The cursor holds a configured broker index. A round starts at the first
//! available broker at or after it, wrapping around. After a round that
//! yields a job the cursor moves just past the broker that supplied it;
//! after an empty round it moves past the broker the round started with.
//! Brokers dropping out mid-round therefore never shift the order, and no
//! available broker can be starved while another keeps returning work.

use chrono::Utc;
use relay_core::types::Timestamp;

use crate::client::BrokerClient;

/// One configured broker and its health bookkeeping.
#[derive(Debug)]
pub struct BrokerEntry {
    pub client: BrokerClient,
    pub available: bool,
    pub last_error: Option<String>,
    pub jobs_claimed: u64,
    pub last_job_at: Option<Timestamp>,
}

/// The worker's configured brokers, in configured order.
#[derive(Debug)]
pub struct BrokerPool {
    entries: Vec<BrokerEntry>,
    cursor: usize,
}

impl BrokerPool {
    /// All brokers start unavailable until a health check succeeds.
    pub fn new(clients: Vec<BrokerClient>) -> Self {
        let entries = clients
            .into_iter()
            .map(|client| BrokerEntry {
                client,
                available: false,
                last_error: None,
                jobs_claimed: 0,
                last_job_at: None,
            })
            .collect();
        Self { entries, cursor: 0 }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[BrokerEntry] {
        &self.entries
    }

    pub fn client(&self, index: usize) -> &BrokerClient {
        &self.entries[index].client
    }

    pub fn available_count(&self) -> usize {
        self.entries.iter().filter(|e| e.available).count()
    }

    /// Indices of available brokers, in configured order.
    pub fn available(&self) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.available)
            .map(|(i, _)| i)
            .collect()
    }

    /// Broker indices to try this round, starting at the cursor.
    pub fn round(&self) -> Vec<usize> {
        let mut available = self.available();
        let start = available
            .iter()
            .position(|&i| i >= self.cursor)
            .unwrap_or(0);
        available.rotate_left(start);
        available
    }

    /// Close `round`. `served` is the broker index that yielded a job, or
    /// `None` for an empty round.
    pub fn finish_round(&mut self, round: &[usize], served: Option<usize>) {
        let Some(&first) = round.first() else {
            return;
        };
        let last = served.unwrap_or(first);
        self.cursor = (last + 1) % self.entries.len();
    }

    /// Returns `true` when the broker was previously available.
    pub fn mark_unavailable(&mut self, index: usize, reason: impl Into<String>) -> bool {
        let entry = &mut self.entries[index];
        let reason = reason.into();
        let was_available = entry.available;
        if was_available {
            tracing::warn!(broker = %entry.client.base_url(), error = %reason, "Broker marked unavailable");
        }
        entry.available = false;
        entry.last_error = Some(reason);
        was_available
    }

    /// Returns `true` when the broker was previously unavailable.
    pub fn mark_available(&mut self, index: usize) -> bool {
        let entry = &mut self.entries[index];
        let recovered = !entry.available;
        entry.available = true;
        entry.last_error = None;
        recovered
    }

    pub fn record_job(&mut self, index: usize) {
        let entry = &mut self.entries[index];
        entry.jobs_claimed += 1;
        entry.last_job_at = Some(Utc::now());
    }

    /// One-line per-broker summary for status logging.
    pub fn summary(&self) -> String {
        self.entries
            .iter()
            .map(|e| {
                format!(
                    "{} [{}] jobs={}",
                    e.client.base_url(),
                    if e.available { "up" } else { "down" },
                    e.jobs_claimed
                )
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}
