use std::fmt;

/// Candidate id stored in the lease row while nobody holds the lease.
pub const NO_LEADER_CANDIDATE_ID: &str = "//noleader//";

/// `last_seen_timestamp` stored in the lease row while nobody holds the lease.
pub const NO_LEADER_LAST_SEEN_MS: i64 = 0;

/// The lease row as read under lock, together with the database's own clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRow {
    pub candidate_id: String,
    /// Milliseconds since the epoch, UTC, as written by the last leader.
    pub last_seen_timestamp: i64,
    /// The database's clock at the time of the read.
    pub now_utc_ms: i64,
    pub lease_counter: i64,
}

/// Who the lease row says holds the lease, from one candidate's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Holder {
    Me,
    Nobody,
    SomeoneElse,
}

impl LeaseRow {
    pub fn holder(&self, own_candidate_id: &str) -> Holder {
        if self.candidate_id == own_candidate_id {
            Holder::Me
        } else if self.candidate_id == NO_LEADER_CANDIDATE_ID {
            Holder::Nobody
        } else {
            Holder::SomeoneElse
        }
    }

    /// Time passed since the last leader affirmed, measured on the database clock.
    pub fn lease_age_ms(&self) -> i64 {
        self.now_utc_ms.saturating_sub(self.last_seen_timestamp)
    }

    pub fn is_expired(&self, assume_dead_ms: i64) -> bool {
        self.lease_age_ms() >= assume_dead_ms
    }

    /// A row without a leader must have been written by a relinquish.
    pub fn is_consistent(&self) -> bool {
        self.candidate_id != NO_LEADER_CANDIDATE_ID
            || self.last_seen_timestamp == NO_LEADER_LAST_SEEN_MS
    }
}

impl fmt::Display for LeaseRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[candidate_id=\"{}\", last_seen_timestamp={}, now_utc_ms={}, lease_counter={}]",
            self.candidate_id, self.last_seen_timestamp, self.now_utc_ms, self.lease_counter
        )
    }
}

/// Lease counter written by a takeover. Wraps to 0 after `i64::MAX`.
pub fn next_lease_counter(current: i64) -> i64 {
    current.checked_add(1).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(candidate_id: &str, last_seen: i64, now: i64) -> LeaseRow {
        LeaseRow {
            candidate_id: candidate_id.to_string(),
            last_seen_timestamp: last_seen,
            now_utc_ms: now,
            lease_counter: 3,
        }
    }

    #[test]
    fn holder_from_candidate_point_of_view() {
        assert_eq!(row("a", 1, 2).holder("a"), Holder::Me);
        assert_eq!(row("b", 1, 2).holder("a"), Holder::SomeoneElse);
        assert_eq!(row(NO_LEADER_CANDIDATE_ID, 0, 2).holder("a"), Holder::Nobody);
    }

    #[test]
    fn expiry_is_measured_on_database_clock() {
        assert!(!row("b", 1_000, 40_999).is_expired(40_000));
        assert!(row("b", 1_000, 41_000).is_expired(40_000));
        assert!(row(NO_LEADER_CANDIDATE_ID, 0, 41_000).is_expired(40_000));
    }

    #[test]
    fn clock_going_backwards_is_not_expiry() {
        let r = row("b", 50_000, 10_000);
        assert_eq!(r.lease_age_ms(), -40_000);
        assert!(!r.is_expired(40_000));
    }

    #[test]
    fn no_leader_row_must_have_zero_timestamp() {
        assert!(row(NO_LEADER_CANDIDATE_ID, 0, 5).is_consistent());
        assert!(!row(NO_LEADER_CANDIDATE_ID, 4, 5).is_consistent());
        assert!(row("b", 4, 5).is_consistent());
    }

    #[test]
    fn lease_counter_wraps_to_zero() {
        assert_eq!(next_lease_counter(0), 1);
        assert_eq!(next_lease_counter(41), 42);
        assert_eq!(next_lease_counter(i64::MAX), 0);
    }
}
