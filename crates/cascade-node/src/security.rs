//! Security supervisor
//!
//! Watches the other subsystems through read-only observations, raises
//! alerts when rolling-window detectors fire, keeps a bounded append-only
//! audit log, and trips a circuit breaker that pauses outbound bridge
//! operations when withdrawal pressure or an emergency alert crosses the
//! line.
//!
//! Detectors run on a one hour window against a 24 hour historical mean.

use crate::types::{Address, Hash, Timestamp};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Rolling detector window
pub const DETECTOR_WINDOW_SECS: u64 = 3600;

/// History kept for the hourly mean
pub const HISTORY_WINDOW_SECS: u64 = 24 * 3600;

/// Circuit breaker cooldown before an operator may reset
pub const BREAKER_COOLDOWN_SECS: u64 = 24 * 3600;

/// Audit log capacity
pub const AUDIT_CAPACITY: usize = 10_000;

/// One structural-failure audit entry per offender per this window
pub const OFFENDER_LOG_WINDOW_SECS: u64 = 3600;

/// Alert severity
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlertType {
    Info,
    Warning,
    Critical,
    Emergency,
}

/// What a detector or subsystem is complaining about
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlertCategory {
    VolumeSpike,
    ValueSpike,
    AddressFrequency,
    BridgeDiscrepancy,
    ReputationDrop,
    SequencerUptime,
    ConsensusFailure,
    InvariantViolation,
    CircuitBreaker,
    Equivocation,
}

/// A raised alert
#[derive(Clone, Debug)]
pub struct SecurityAlert {
    pub id: u64,
    pub alert_type: AlertType,
    pub category: AlertCategory,
    pub message: String,
    pub details: String,
    pub timestamp: Timestamp,
    pub involved_addresses: Vec<Address>,
    pub related_tx_hashes: Vec<Hash>,
    pub acknowledged: bool,
    pub resolved: bool,
}

/// Audit trail entry
#[derive(Clone, Debug)]
pub struct AuditEntry {
    pub id: u64,
    pub timestamp: Timestamp,
    pub category: AuditCategory,
    pub action: String,
    pub actor: Option<Address>,
    pub target: Option<Address>,
    pub details: String,
    pub metadata: BTreeMap<String, String>,
    pub related_tx_hash: Option<Hash>,
    pub success: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuditCategory {
    Consensus,
    Bridge,
    BridgeDiscrepancy,
    Registry,
    State,
    Security,
}

/// Bounded append-only audit log, FIFO-pruned by capacity and age
pub struct AuditLog {
    entries: VecDeque<AuditEntry>,
    next_id: u64,
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            next_id: 1,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &mut self,
        timestamp: Timestamp,
        category: AuditCategory,
        action: impl Into<String>,
        actor: Option<Address>,
        target: Option<Address>,
        details: impl Into<String>,
        related_tx_hash: Option<Hash>,
        success: bool,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push_back(AuditEntry {
            id,
            timestamp,
            category,
            action: action.into(),
            actor,
            target,
            details: details.into(),
            metadata: BTreeMap::new(),
            related_tx_hash,
            success,
        });
        while self.entries.len() > AUDIT_CAPACITY {
            self.entries.pop_front();
        }
        id
    }

    /// Drop entries older than the retention window
    pub fn prune_older_than(&mut self, cutoff: Timestamp) {
        while self
            .entries
            .front()
            .map_or(false, |e| e.timestamp < cutoff)
        {
            self.entries.pop_front();
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &AuditEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Circuit breaker state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakerState {
    Normal,
    Triggered,
    Recovery,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecurityError {
    #[error("circuit breaker is not triggered")]
    NotTriggered,

    #[error("circuit breaker cooldown has {0}s remaining")]
    CooldownActive(u64),

    #[error("unknown alert {0}")]
    UnknownAlert(u64),
}

/// Tracks TVL against rolling 24h outbound volume and pauses the bridge
/// when the ratio crosses the configured limit.
pub struct CircuitBreaker {
    state: BreakerState,
    tvl: u64,
    outflows: VecDeque<(Timestamp, u64)>,
    /// daily_volume / tvl ratio that trips, in basis points
    trip_ratio_bps: u64,
    triggered_at: Option<Timestamp>,
    trigger_reason: Option<String>,
}

impl CircuitBreaker {
    pub fn new(trip_ratio_bps: u64) -> Self {
        Self {
            state: BreakerState::Normal,
            tvl: 0,
            outflows: VecDeque::new(),
            trip_ratio_bps,
            triggered_at: None,
            trigger_reason: None,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn tvl(&self) -> u64 {
        self.tvl
    }

    pub fn set_tvl(&mut self, tvl: u64) {
        self.tvl = tvl;
    }

    pub fn trigger_reason(&self) -> Option<&str> {
        self.trigger_reason.as_deref()
    }

    /// Outbound operations are only admitted in NORMAL state
    pub fn allows_outbound(&self) -> bool {
        self.state == BreakerState::Normal
    }

    pub fn daily_outflow(&self, now: Timestamp) -> u64 {
        let cutoff = now.saturating_sub(HISTORY_WINDOW_SECS);
        self.outflows
            .iter()
            .filter(|(ts, _)| *ts >= cutoff)
            .map(|(_, v)| v)
            .sum()
    }

    /// Record an outbound amount; returns true if this pushed the ratio
    /// over the line and tripped the breaker.
    pub fn record_outflow(&mut self, amount: u64, now: Timestamp) -> bool {
        self.outflows.push_back((now, amount));
        let cutoff = now.saturating_sub(HISTORY_WINDOW_SECS);
        while self.outflows.front().map_or(false, |(ts, _)| *ts < cutoff) {
            self.outflows.pop_front();
        }

        if self.state != BreakerState::Normal || self.tvl == 0 {
            return false;
        }
        let daily = self.daily_outflow(now);
        if (daily as u128) * 10_000 >= (self.tvl as u128) * (self.trip_ratio_bps as u128) {
            self.trip("daily outflow ratio exceeded", now);
            return true;
        }
        false
    }

    /// Force the breaker open (emergency alerts land here).
    pub fn trip(&mut self, reason: &str, now: Timestamp) {
        if self.state == BreakerState::Triggered {
            return;
        }
        self.state = BreakerState::Triggered;
        self.triggered_at = Some(now);
        self.trigger_reason = Some(reason.to_string());
        tracing::error!(reason, "circuit breaker TRIGGERED");
    }

    pub fn cooldown_remaining(&self, now: Timestamp) -> u64 {
        match self.triggered_at {
            Some(at) => (at + BREAKER_COOLDOWN_SECS).saturating_sub(now),
            None => 0,
        }
    }

    /// Operator reset after cooldown: TRIGGERED -> RECOVERY -> NORMAL.
    /// Returns the transitions passed through so both callbacks fire.
    pub fn reset(&mut self, now: Timestamp) -> Result<[BreakerState; 2], SecurityError> {
        if self.state != BreakerState::Triggered {
            return Err(SecurityError::NotTriggered);
        }
        let remaining = self.cooldown_remaining(now);
        if remaining > 0 {
            return Err(SecurityError::CooldownActive(remaining));
        }
        self.state = BreakerState::Normal;
        self.triggered_at = None;
        self.trigger_reason = None;
        self.outflows.clear();
        tracing::info!("circuit breaker reset");
        Ok([BreakerState::Recovery, BreakerState::Normal])
    }
}

/// Detector thresholds
#[derive(Clone, Debug)]
pub struct SecurityConfig {
    /// Current window count/value must exceed this multiple of the
    /// historical hourly mean
    pub spike_multiplier: f64,
    pub max_txs_per_address_hour: usize,
    /// Relative bridge balance discrepancy tolerated
    pub bridge_discrepancy_tolerance: f64,
    /// Single-step reputation drop that alerts
    pub reputation_drop_threshold: u32,
    pub min_uptime: f64,
    pub uptime_window_blocks: u64,
    pub breaker_trip_ratio_bps: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            spike_multiplier: 3.0,
            max_txs_per_address_hour: 100,
            bridge_discrepancy_tolerance: 0.01,
            reputation_drop_threshold: 20,
            min_uptime: 0.90,
            uptime_window_blocks: 10,
            breaker_trip_ratio_bps: 1000,
        }
    }
}

struct TxObservation {
    timestamp: Timestamp,
    sender: Address,
    value: u64,
}

/// The security supervisor
pub struct SecuritySupervisor {
    config: SecurityConfig,
    alerts: Vec<SecurityAlert>,
    next_alert_id: u64,
    observations: VecDeque<TxObservation>,
    last_reputation: HashMap<Address, u32>,
    offender_log: HashMap<Address, Timestamp>,
    pub audit: AuditLog,
    pub breaker: CircuitBreaker,
}

impl SecuritySupervisor {
    pub fn new(config: SecurityConfig) -> Self {
        let breaker = CircuitBreaker::new(config.breaker_trip_ratio_bps);
        Self {
            config,
            alerts: Vec::new(),
            next_alert_id: 1,
            observations: VecDeque::new(),
            last_reputation: HashMap::new(),
            offender_log: HashMap::new(),
            audit: AuditLog::new(),
            breaker,
        }
    }

    pub fn alerts(&self) -> &[SecurityAlert] {
        &self.alerts
    }

    pub fn unresolved_alerts(&self) -> impl Iterator<Item = &SecurityAlert> {
        self.alerts.iter().filter(|a| !a.resolved)
    }

    /// Raise an alert. EMERGENCY automatically trips the circuit breaker.
    pub fn raise_alert(
        &mut self,
        alert_type: AlertType,
        category: AlertCategory,
        message: impl Into<String>,
        details: impl Into<String>,
        involved: Vec<Address>,
        related_txs: Vec<Hash>,
        now: Timestamp,
    ) -> u64 {
        let id = self.next_alert_id;
        self.next_alert_id += 1;
        let message = message.into();

        self.alerts.push(SecurityAlert {
            id,
            alert_type,
            category,
            message: message.clone(),
            details: details.into(),
            timestamp: now,
            involved_addresses: involved,
            related_tx_hashes: related_txs,
            acknowledged: false,
            resolved: false,
        });
        self.audit.append(
            now,
            AuditCategory::Security,
            "alert_raised",
            None,
            None,
            message.clone(),
            None,
            true,
        );

        match alert_type {
            AlertType::Emergency => {
                tracing::error!(%message, "EMERGENCY alert");
                self.breaker.trip(&message, now);
            }
            AlertType::Critical => tracing::error!(%message, "critical alert"),
            AlertType::Warning => tracing::warn!(%message, "warning alert"),
            AlertType::Info => tracing::info!(%message, "info alert"),
        }
        id
    }

    pub fn acknowledge_alert(&mut self, id: u64) -> Result<(), SecurityError> {
        let alert = self
            .alerts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(SecurityError::UnknownAlert(id))?;
        alert.acknowledged = true;
        Ok(())
    }

    pub fn resolve_alert(&mut self, id: u64, note: &str, now: Timestamp) -> Result<(), SecurityError> {
        let alert = self
            .alerts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(SecurityError::UnknownAlert(id))?;
        alert.resolved = true;
        self.audit.append(
            now,
            AuditCategory::Security,
            "alert_resolved",
            None,
            None,
            note,
            None,
            true,
        );
        Ok(())
    }

    /// Feed one applied transaction into the rolling detectors. Returns
    /// ids of any alerts raised.
    pub fn observe_transaction(
        &mut self,
        sender: Address,
        value: u64,
        now: Timestamp,
    ) -> Vec<u64> {
        self.observations.push_back(TxObservation {
            timestamp: now,
            sender,
            value,
        });
        let cutoff = now.saturating_sub(HISTORY_WINDOW_SECS);
        while self
            .observations
            .front()
            .map_or(false, |o| o.timestamp < cutoff)
        {
            self.observations.pop_front();
        }

        let mut raised = Vec::new();
        let window_start = now.saturating_sub(DETECTOR_WINDOW_SECS);

        let (mut window_count, mut window_value) = (0u64, 0u64);
        let (mut total_count, mut total_value) = (0u64, 0u64);
        let mut sender_count = 0usize;
        for o in &self.observations {
            total_count += 1;
            total_value = total_value.saturating_add(o.value);
            if o.timestamp >= window_start {
                window_count += 1;
                window_value = window_value.saturating_add(o.value);
                if o.sender == sender {
                    sender_count += 1;
                }
            }
        }

        // historical hourly means over the 24h history, floored at one so
        // a quiet chain does not alert on its first transactions
        let hourly_count_mean = (total_count as f64 / 24.0).max(1.0);
        let hourly_value_mean = (total_value as f64 / 24.0).max(1.0);

        if window_count as f64 > self.config.spike_multiplier * hourly_count_mean {
            raised.push(self.raise_alert(
                AlertType::Warning,
                AlertCategory::VolumeSpike,
                "transaction volume spike",
                format!("{window_count} txs in the last hour vs mean {hourly_count_mean:.1}"),
                vec![],
                vec![],
                now,
            ));
        }
        if window_value as f64 > self.config.spike_multiplier * hourly_value_mean {
            raised.push(self.raise_alert(
                AlertType::Warning,
                AlertCategory::ValueSpike,
                "transaction value spike",
                format!("{window_value} sat in the last hour vs mean {hourly_value_mean:.1}"),
                vec![],
                vec![],
                now,
            ));
        }
        if sender_count > self.config.max_txs_per_address_hour {
            raised.push(self.raise_alert(
                AlertType::Warning,
                AlertCategory::AddressFrequency,
                "address transaction frequency",
                format!("{sender_count} txs from one sender in the last hour"),
                vec![sender],
                vec![],
                now,
            ));
        }
        raised
    }

    /// Compare the actual bridge balance against the expected one.
    pub fn check_bridge_balance(
        &mut self,
        actual: u64,
        expected: u64,
        now: Timestamp,
    ) -> Option<u64> {
        if expected == 0 {
            return None;
        }
        let discrepancy = (actual as f64 - expected as f64).abs() / expected as f64;
        if discrepancy <= self.config.bridge_discrepancy_tolerance {
            return None;
        }
        Some(self.raise_alert(
            AlertType::Critical,
            AlertCategory::BridgeDiscrepancy,
            "bridge balance discrepancy",
            format!("actual {actual}, expected {expected}"),
            vec![],
            vec![],
            now,
        ))
    }

    /// Track a reputation score; a large single-step drop alerts.
    pub fn observe_reputation(&mut self, address: Address, score: u32, now: Timestamp) -> Option<u64> {
        let previous = self.last_reputation.insert(address, score);
        let Some(previous) = previous else {
            return None;
        };
        if previous.saturating_sub(score) < self.config.reputation_drop_threshold {
            return None;
        }
        Some(self.raise_alert(
            AlertType::Warning,
            AlertCategory::ReputationDrop,
            "reputation drop",
            format!("score fell from {previous} to {score}"),
            vec![address],
            vec![],
            now,
        ))
    }

    /// Check a sequencer's uptime once it has enough history.
    pub fn observe_uptime(
        &mut self,
        address: Address,
        blocks_produced: u64,
        blocks_missed: u64,
        now: Timestamp,
    ) -> Option<u64> {
        let total = blocks_produced + blocks_missed;
        if total < self.config.uptime_window_blocks {
            return None;
        }
        let uptime = blocks_produced as f64 / total as f64;
        if uptime >= self.config.min_uptime {
            return None;
        }
        Some(self.raise_alert(
            AlertType::Warning,
            AlertCategory::SequencerUptime,
            "sequencer uptime below threshold",
            format!("uptime {:.1}% over {total} blocks", uptime * 100.0),
            vec![address],
            vec![],
            now,
        ))
    }

    /// Audit a structural rejection, at most once per offender per window.
    pub fn audit_structural_reject(
        &mut self,
        offender: Address,
        action: &str,
        now: Timestamp,
    ) {
        if let Some(last) = self.offender_log.get(&offender) {
            if now.saturating_sub(*last) < OFFENDER_LOG_WINDOW_SECS {
                return;
            }
        }
        self.offender_log.insert(offender, now);
        self.audit.append(
            now,
            AuditCategory::Registry,
            action,
            Some(offender),
            None,
            "structural validation failure",
            None,
            false,
        );
    }

    /// An unrecoverable invariant violation: EMERGENCY alert, breaker
    /// tripped, nothing survives in-process.
    pub fn invariant_violated(&mut self, details: impl Into<String>, now: Timestamp) -> u64 {
        self.raise_alert(
            AlertType::Emergency,
            AlertCategory::InvariantViolation,
            "invariant violation",
            details,
            vec![],
            vec![],
            now,
        )
    }

    /// Record an outbound bridge amount; trips the breaker and raises
    /// EMERGENCY when the daily ratio crosses the line.
    pub fn record_outflow(&mut self, amount: u64, now: Timestamp) -> bool {
        let tripped = self.breaker.record_outflow(amount, now);
        if tripped {
            self.raise_alert(
                AlertType::Emergency,
                AlertCategory::CircuitBreaker,
                "withdrawal volume tripped circuit breaker",
                format!(
                    "daily outflow {} against TVL {}",
                    self.breaker.daily_outflow(now),
                    self.breaker.tvl()
                ),
                vec![],
                vec![],
                now,
            );
        }
        tripped
    }

    /// Periodic sweep: prune aged audit entries.
    pub fn process_timeouts(&mut self, now: Timestamp) {
        self.audit
            .prune_older_than(now.saturating_sub(HISTORY_WINDOW_SECS * 7));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: Timestamp = 1_700_000_000;

    fn supervisor() -> SecuritySupervisor {
        SecuritySupervisor::new(SecurityConfig::default())
    }

    #[test]
    fn test_breaker_ratio_trip() {
        let mut breaker = CircuitBreaker::new(1000);
        breaker.set_tvl(1000);

        // 95 of 1000 is under 10%
        assert!(!breaker.record_outflow(95, NOW));
        assert_eq!(breaker.state(), BreakerState::Normal);
        assert!(breaker.allows_outbound());

        // ten more reaches 10.5%
        assert!(breaker.record_outflow(10, NOW + 60));
        assert_eq!(breaker.state(), BreakerState::Triggered);
        assert!(!breaker.allows_outbound());
    }

    #[test]
    fn test_breaker_reset_after_cooldown() {
        let mut breaker = CircuitBreaker::new(1000);
        breaker.set_tvl(100);
        breaker.record_outflow(50, NOW);
        assert_eq!(breaker.state(), BreakerState::Triggered);

        // reset during cooldown is refused
        assert!(matches!(
            breaker.reset(NOW + 60),
            Err(SecurityError::CooldownActive(_))
        ));

        breaker.reset(NOW + BREAKER_COOLDOWN_SECS + 1).unwrap();
        assert_eq!(breaker.state(), BreakerState::Normal);
        assert!(breaker.allows_outbound());
    }

    #[test]
    fn test_reset_when_normal_fails() {
        let mut breaker = CircuitBreaker::new(1000);
        assert!(matches!(breaker.reset(NOW), Err(SecurityError::NotTriggered)));
    }

    #[test]
    fn test_old_outflows_age_out() {
        let mut breaker = CircuitBreaker::new(1000);
        breaker.set_tvl(1000);
        breaker.record_outflow(95, NOW);

        // 25h later the old outflow no longer counts
        assert_eq!(breaker.daily_outflow(NOW + 25 * 3600), 0);
        assert!(!breaker.record_outflow(95, NOW + 25 * 3600));
    }

    #[test]
    fn test_emergency_alert_trips_breaker() {
        let mut supervisor = supervisor();
        assert_eq!(supervisor.breaker.state(), BreakerState::Normal);

        supervisor.invariant_violated("supply mismatch", NOW);

        assert_eq!(supervisor.breaker.state(), BreakerState::Triggered);
        assert_eq!(supervisor.alerts().len(), 1);
        assert_eq!(supervisor.alerts()[0].alert_type, AlertType::Emergency);
    }

    #[test]
    fn test_address_frequency_detector() {
        let mut supervisor = supervisor();
        let spammer = [1u8; 20];

        let mut raised = Vec::new();
        for i in 0..110 {
            raised.extend(supervisor.observe_transaction(spammer, 1, NOW + i));
        }

        assert!(supervisor
            .alerts()
            .iter()
            .any(|a| a.category == AlertCategory::AddressFrequency
                && a.involved_addresses == vec![spammer]));
        assert!(!raised.is_empty());
    }

    #[test]
    fn test_bridge_discrepancy_detector() {
        let mut supervisor = supervisor();

        // within 1% tolerance
        assert!(supervisor.check_bridge_balance(1000, 1005, NOW).is_none());
        // 5% off
        assert!(supervisor.check_bridge_balance(950, 1000, NOW).is_some());
        assert_eq!(
            supervisor.alerts()[0].category,
            AlertCategory::BridgeDiscrepancy
        );
    }

    #[test]
    fn test_reputation_drop_detector() {
        let mut supervisor = supervisor();
        let addr = [2u8; 20];

        assert!(supervisor.observe_reputation(addr, 80, NOW).is_none());
        // small decrease passes
        assert!(supervisor.observe_reputation(addr, 70, NOW + 1).is_none());
        // 25-point drop alerts
        assert!(supervisor.observe_reputation(addr, 45, NOW + 2).is_some());
    }

    #[test]
    fn test_uptime_detector_needs_history() {
        let mut supervisor = supervisor();
        let addr = [3u8; 20];

        // only five blocks of history: no verdict yet
        assert!(supervisor.observe_uptime(addr, 3, 2, NOW).is_none());
        // 8 of 10 is 80%, below the 90% floor
        assert!(supervisor.observe_uptime(addr, 8, 2, NOW).is_some());
        // 19 of 20 is fine
        assert!(supervisor.observe_uptime(addr, 19, 1, NOW).is_none());
    }

    #[test]
    fn test_alert_acknowledge_and_resolve() {
        let mut supervisor = supervisor();
        let id = supervisor.raise_alert(
            AlertType::Info,
            AlertCategory::ConsensusFailure,
            "test",
            "",
            vec![],
            vec![],
            NOW,
        );

        supervisor.acknowledge_alert(id).unwrap();
        assert!(supervisor.alerts()[0].acknowledged);

        supervisor.resolve_alert(id, "handled", NOW).unwrap();
        assert!(supervisor.alerts()[0].resolved);
        assert_eq!(supervisor.unresolved_alerts().count(), 0);

        assert!(matches!(
            supervisor.acknowledge_alert(999),
            Err(SecurityError::UnknownAlert(999))
        ));
    }

    #[test]
    fn test_audit_log_bounds() {
        let mut log = AuditLog::new();
        for i in 0..(AUDIT_CAPACITY + 50) {
            log.append(
                NOW + i as u64,
                AuditCategory::Consensus,
                "tick",
                None,
                None,
                "",
                None,
                true,
            );
        }
        assert_eq!(log.len(), AUDIT_CAPACITY);
        // FIFO: the earliest entries are gone
        assert!(log.entries().next().unwrap().timestamp > NOW);
    }

    #[test]
    fn test_structural_reject_dedup_per_window() {
        let mut supervisor = supervisor();
        let offender = [9u8; 20];

        supervisor.audit_structural_reject(offender, "bad_announce", NOW);
        supervisor.audit_structural_reject(offender, "bad_announce", NOW + 10);
        assert_eq!(supervisor.audit.len(), 1);

        // next window logs again
        supervisor.audit_structural_reject(offender, "bad_announce", NOW + OFFENDER_LOG_WINDOW_SECS + 1);
        assert_eq!(supervisor.audit.len(), 2);
    }
}
