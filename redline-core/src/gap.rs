//! Sequence-gap detection records and their lifecycle.
//!
//! A gap is a missing run of sequence numbers observed between two received
//! events. Gaps never block delivery; they are recorded, classified by
//! width, and exposed for diagnostics and replay triggering. The tracker is
//! an explicitly constructed service object: callers hold a reference,
//! tests build independent instances, and there is no process-global state.
//!
//! Lifecycle: `Detected` → `Resolved` | `Terminated`; both end states are
//! final and move the record into a history bounded to the trailing 24 hours.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::types::SessionId;

/// How disruptive a gap is, derived from its width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GapSeverity {
    /// Narrow gap; routine loss, replay will cover it.
    Info,
    /// Noticeable gap; worth surfacing to diagnostics.
    Warn,
    /// Wide gap; the stream is likely badly behind or broken.
    Critical,
}

impl GapSeverity {
    /// Metric/diagnostic label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Critical => "critical",
        }
    }
}

/// Lifecycle state of a gap record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GapLifecycle {
    /// Open; awaiting replay or supersession.
    Detected,
    /// A later event filled or superseded the gap. Terminal.
    Resolved,
    /// Judged unrecoverable. Terminal.
    Terminated,
}

/// One detected discontinuity in a session's sequence stream.
#[derive(Debug, Clone, Serialize)]
pub struct GapMetadata {
    /// Unique gap identifier.
    pub gap_id: String,
    /// Session whose stream the gap was observed on.
    pub session_id: SessionId,
    /// Last good sequence seen before the gap.
    pub start_sequence: u64,
    /// First sequence seen after the gap.
    pub end_sequence: u64,
    /// Severity derived from the gap width at detection time.
    pub severity: GapSeverity,
    /// Subsystem that reported the gap, e.g. `sse_stream`.
    pub provenance: String,
    /// Current lifecycle state.
    pub lifecycle: GapLifecycle,
    /// Detection timestamp.
    pub detected_at: DateTime<Utc>,
    /// Sequence that resolved the gap; set only on resolution.
    pub resolution_sequence: Option<u64>,
    /// When the gap left the active set.
    pub closed_at: Option<DateTime<Utc>>,
}

impl GapMetadata {
    /// Number of missing sequences: `end_sequence - start_sequence - 1`.
    #[must_use]
    pub const fn width(&self) -> u64 {
        self.end_sequence.saturating_sub(self.start_sequence).saturating_sub(1)
    }
}

/// Point-in-time view for diagnostics UIs.
#[derive(Debug, Clone, Serialize)]
pub struct GapReport {
    /// Gaps still in the `Detected` state.
    pub open_gaps: Vec<GapMetadata>,
    /// Gaps resolved or terminated within the trailing 24 hours.
    pub resolved_gaps_24h: Vec<GapMetadata>,
}

/// Counters over active gaps by severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeverityCounts {
    /// Active gaps classified INFO.
    pub info: usize,
    /// Active gaps classified WARN.
    pub warn: usize,
    /// Active gaps classified CRITICAL.
    pub critical: usize,
}

/// Aggregate gap counters for diagnostics endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct GapStatistics {
    /// Gaps currently open.
    pub total_active: usize,
    /// Gaps closed within the trailing 24 hours.
    pub total_resolved_24h: usize,
    /// Active gaps broken down by severity.
    pub active_by_severity: SeverityCounts,
    /// Detection time of the oldest still-open gap.
    pub oldest_active_gap: Option<DateTime<Utc>>,
}

/// Tracks every open gap and a bounded history of closed ones.
pub struct GapTracker {
    active: DashMap<String, GapMetadata>,
    closed: Mutex<VecDeque<GapMetadata>>,
    warn_threshold: u64,
    critical_threshold: u64,
    history_retention: Duration,
}

impl GapTracker {
    /// Creates a tracker using the severity thresholds of `config` and the
    /// standard 24-hour history window.
    #[must_use]
    pub fn new(config: &SyncConfig) -> Self {
        Self::with_retention(config, Duration::hours(24))
    }

    /// Creates a tracker with an explicit history retention window.
    #[must_use]
    pub fn with_retention(config: &SyncConfig, history_retention: Duration) -> Self {
        Self {
            active: DashMap::new(),
            closed: Mutex::new(VecDeque::new()),
            warn_threshold: config.gap_warn_threshold,
            critical_threshold: config.gap_critical_threshold,
            history_retention,
        }
    }

    /// Classifies a gap width against the configured thresholds.
    #[must_use]
    pub const fn classify(&self, width: u64) -> GapSeverity {
        if width >= self.critical_threshold {
            GapSeverity::Critical
        } else if width >= self.warn_threshold {
            GapSeverity::Warn
        } else {
            GapSeverity::Info
        }
    }

    /// Registers a newly observed discontinuity.
    ///
    /// `last_seq_received` is the last good sequence before the gap and
    /// `expected_seq` the highest sequence still missing, so the recorded
    /// run spans `last_seq_received + 1 ..= expected_seq` and
    /// `end_sequence = expected_seq + 1` is the first sequence seen after
    /// the gap.
    pub fn on_gap_detected(
        &self,
        session_id: SessionId,
        last_seq_received: u64,
        expected_seq: u64,
        provenance: impl Into<String>,
    ) -> GapMetadata {
        let end_sequence = expected_seq.saturating_add(1);
        let width = end_sequence
            .saturating_sub(last_seq_received)
            .saturating_sub(1);
        let severity = self.classify(width);
        let gap = GapMetadata {
            gap_id: uuid::Uuid::new_v4().to_string(),
            session_id,
            start_sequence: last_seq_received,
            end_sequence,
            severity,
            provenance: provenance.into(),
            lifecycle: GapLifecycle::Detected,
            detected_at: Utc::now(),
            resolution_sequence: None,
            closed_at: None,
        };

        match severity {
            GapSeverity::Critical => warn!(
                session = %gap.session_id,
                gap_id = %gap.gap_id,
                width,
                "critical sequence gap detected"
            ),
            _ => debug!(
                session = %gap.session_id,
                gap_id = %gap.gap_id,
                width,
                severity = severity.as_str(),
                "sequence gap detected"
            ),
        }

        self.active.insert(gap.gap_id.clone(), gap.clone());
        gap
    }

    /// Applies a lifecycle transition by state name.
    ///
    /// Only `Detected → Resolved` and `Detected → Terminated` are legal;
    /// anything else (including re-detecting a closed gap) returns `false`.
    pub fn update_lifecycle(&self, gap_id: &str, new_state: GapLifecycle) -> bool {
        match new_state {
            GapLifecycle::Resolved => self.close(gap_id, GapLifecycle::Resolved, None),
            GapLifecycle::Terminated => self.close(gap_id, GapLifecycle::Terminated, None),
            GapLifecycle::Detected => false,
        }
    }

    /// Marks a gap filled or superseded by `resolution_sequence`.
    pub fn resolve_gap(&self, gap_id: &str, resolution_sequence: u64) -> bool {
        self.close(gap_id, GapLifecycle::Resolved, Some(resolution_sequence))
    }

    /// Marks a gap unrecoverable.
    pub fn terminate_gap(&self, gap_id: &str) -> bool {
        self.close(gap_id, GapLifecycle::Terminated, None)
    }

    fn close(
        &self,
        gap_id: &str,
        final_state: GapLifecycle,
        resolution_sequence: Option<u64>,
    ) -> bool {
        let Some((_, mut gap)) = self.active.remove(gap_id) else {
            return false;
        };
        gap.lifecycle = final_state;
        gap.resolution_sequence = resolution_sequence;
        gap.closed_at = Some(Utc::now());

        let mut closed = self.closed.lock();
        closed.push_back(gap);
        Self::prune_locked(&mut closed, self.history_retention);
        true
    }

    /// Drops history entries older than the retention window. Returns the
    /// number removed. Called by the background maintenance sweep.
    pub fn prune_history(&self) -> usize {
        let mut closed = self.closed.lock();
        Self::prune_locked(&mut closed, self.history_retention)
    }

    fn prune_locked(closed: &mut VecDeque<GapMetadata>, retention: Duration) -> usize {
        let cutoff = Utc::now() - retention;
        let before = closed.len();
        closed.retain(|gap| gap.closed_at.is_none_or(|at| at > cutoff));
        before - closed.len()
    }

    /// Primary read interface for diagnostics UIs.
    #[must_use]
    pub fn gap_report(&self) -> GapReport {
        self.prune_history();
        let mut open_gaps: Vec<GapMetadata> =
            self.active.iter().map(|entry| entry.value().clone()).collect();
        open_gaps.sort_by_key(|gap| gap.detected_at);
        GapReport {
            open_gaps,
            resolved_gaps_24h: self.closed.lock().iter().cloned().collect(),
        }
    }

    /// Aggregate counters for health endpoints.
    #[must_use]
    pub fn gap_statistics(&self) -> GapStatistics {
        self.prune_history();
        let mut by_severity = SeverityCounts::default();
        let mut oldest: Option<DateTime<Utc>> = None;
        for entry in self.active.iter() {
            let gap = entry.value();
            match gap.severity {
                GapSeverity::Info => by_severity.info += 1,
                GapSeverity::Warn => by_severity.warn += 1,
                GapSeverity::Critical => by_severity.critical += 1,
            }
            oldest = Some(oldest.map_or(gap.detected_at, |old| old.min(gap.detected_at)));
        }
        GapStatistics {
            total_active: self.active.len(),
            total_resolved_24h: self.closed.lock().len(),
            active_by_severity: by_severity,
            oldest_active_gap: oldest,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::expect_used)]
mod tests {
    use super::*;

    fn session() -> SessionId {
        SessionId::new("gap-session").unwrap()
    }

    fn tracker() -> GapTracker {
        GapTracker::new(&SyncConfig::default())
    }

    /// Detects a gap with the given width via the (last, expected) calling
    /// convention: missing run is last+1..=expected.
    fn detect(tracker: &GapTracker, last: u64, width: u64) -> GapMetadata {
        tracker.on_gap_detected(session(), last, last + width, "test")
    }

    #[test]
    fn classification_thresholds() {
        let tracker = tracker();
        assert_eq!(tracker.classify(2), GapSeverity::Info);
        assert_eq!(tracker.classify(3), GapSeverity::Warn);
        assert_eq!(tracker.classify(5), GapSeverity::Warn);
        assert_eq!(tracker.classify(9), GapSeverity::Warn);
        assert_eq!(tracker.classify(10), GapSeverity::Critical);
        assert_eq!(tracker.classify(12), GapSeverity::Critical);
    }

    #[test]
    fn detection_records_bounds_and_width() {
        let tracker = tracker();
        // Last good sequence 1, sequences 2..=9 missing, 10 seen next.
        let gap = tracker.on_gap_detected(session(), 1, 9, "sse_stream");
        assert_eq!(gap.start_sequence, 1);
        assert_eq!(gap.end_sequence, 10);
        assert_eq!(gap.width(), 8);
        assert_eq!(gap.severity, GapSeverity::Warn);
        assert_eq!(gap.lifecycle, GapLifecycle::Detected);
        assert_eq!(gap.provenance, "sse_stream");
    }

    #[test]
    fn widths_classify_per_contract() {
        let tracker = tracker();
        assert_eq!(detect(&tracker, 0, 2).severity, GapSeverity::Info);
        assert_eq!(detect(&tracker, 0, 5).severity, GapSeverity::Warn);
        assert_eq!(detect(&tracker, 0, 12).severity, GapSeverity::Critical);
    }

    #[test]
    fn resolve_moves_gap_to_history() {
        let tracker = tracker();
        let gap = detect(&tracker, 3, 2);

        assert!(tracker.resolve_gap(&gap.gap_id, 7));
        let report = tracker.gap_report();
        assert!(report.open_gaps.is_empty());
        assert_eq!(report.resolved_gaps_24h.len(), 1);
        let resolved = &report.resolved_gaps_24h[0];
        assert_eq!(resolved.lifecycle, GapLifecycle::Resolved);
        assert_eq!(resolved.resolution_sequence, Some(7));
        assert!(resolved.closed_at.is_some());
    }

    #[test]
    fn terminate_is_terminal_too() {
        let tracker = tracker();
        let gap = detect(&tracker, 3, 2);

        assert!(tracker.terminate_gap(&gap.gap_id));
        let report = tracker.gap_report();
        assert_eq!(report.resolved_gaps_24h[0].lifecycle, GapLifecycle::Terminated);
    }

    #[test]
    fn closed_gaps_cannot_transition_again() {
        let tracker = tracker();
        let gap = detect(&tracker, 0, 4);
        assert!(tracker.resolve_gap(&gap.gap_id, 5));

        assert!(!tracker.resolve_gap(&gap.gap_id, 6));
        assert!(!tracker.terminate_gap(&gap.gap_id));
        assert!(!tracker.update_lifecycle(&gap.gap_id, GapLifecycle::Detected));
    }

    #[test]
    fn update_lifecycle_routes_to_terminal_states() {
        let tracker = tracker();
        let resolved = detect(&tracker, 0, 1);
        let terminated = detect(&tracker, 10, 1);

        assert!(tracker.update_lifecycle(&resolved.gap_id, GapLifecycle::Resolved));
        assert!(tracker.update_lifecycle(&terminated.gap_id, GapLifecycle::Terminated));
        assert!(!tracker.update_lifecycle("unknown-gap", GapLifecycle::Resolved));
        assert_eq!(tracker.gap_report().resolved_gaps_24h.len(), 2);
    }

    #[test]
    fn multiple_gaps_tracked_independently() {
        let tracker = tracker();
        let first = detect(&tracker, 1, 2);
        let second = detect(&tracker, 20, 11);

        assert!(tracker.resolve_gap(&first.gap_id, 4));
        let report = tracker.gap_report();
        assert_eq!(report.open_gaps.len(), 1);
        assert_eq!(report.open_gaps[0].gap_id, second.gap_id);
    }

    #[test]
    fn statistics_break_down_by_severity() {
        let tracker = tracker();
        detect(&tracker, 0, 1);
        detect(&tracker, 10, 4);
        detect(&tracker, 30, 15);
        let resolved = detect(&tracker, 50, 1);
        tracker.resolve_gap(&resolved.gap_id, 52);

        let stats = tracker.gap_statistics();
        assert_eq!(stats.total_active, 3);
        assert_eq!(stats.total_resolved_24h, 1);
        assert_eq!(
            stats.active_by_severity,
            SeverityCounts { info: 1, warn: 1, critical: 1 }
        );
        assert!(stats.oldest_active_gap.is_some());
    }

    #[test]
    fn zero_retention_drops_history_immediately() {
        let tracker = GapTracker::with_retention(&SyncConfig::default(), Duration::zero());
        let gap = detect(&tracker, 0, 2);
        assert!(tracker.resolve_gap(&gap.gap_id, 3));

        assert_eq!(tracker.gap_report().resolved_gaps_24h.len(), 0);
        assert_eq!(tracker.gap_statistics().total_resolved_24h, 0);
    }
}
