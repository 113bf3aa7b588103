//! VM lifecycle phase tracking.
//!
//! Pure data-structure logic: the transition table lives here, the I/O that
//! causes transitions lives in `provision`/`teardown`. A reconciler persists
//! `VmStatus` objects; this module guarantees it can only move them along
//! legal edges.
//!
//! ```text
//!   Pending ──▶ Creating ──▶ Running ◀──▶ Stopping/Stopped
//!                   │            │              │
//!                   └────────────┴──▶ Failed ◀──┘   (from any non-terminal)
//! ```

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::ForgeError;

/// Coarse lifecycle state of a managed VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Pending,
    Creating,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Pending => "Pending",
            Phase::Creating => "Creating",
            Phase::Running => "Running",
            Phase::Stopping => "Stopping",
            Phase::Stopped => "Stopped",
            Phase::Failed => "Failed",
        }
    }

    /// Failed has no outgoing edges — recreation starts a fresh status
    /// object externally.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Failed)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Names of the conditions tracked on a VM status. Only `Ready` is actively
/// maintained by the lifecycle core; the rest are placeholders for future
/// producers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionKind {
    Ready,
    StorageProvisioned,
    NetworkConfigured,
    CloudInitReady,
}

/// A named, timestamped boolean-ish status flag with reason and message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub kind: ConditionKind,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition: String,
}

/// Per-interface derived fields, produced by `naming` at provision time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceStatus {
    pub mac: String,
    pub tap: String,
}

/// Persisted status of a managed VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmStatus {
    pub phase: Phase,
    pub conditions: Vec<Condition>,
    pub domain_uuid: Option<String>,
    pub interfaces: Vec<InterfaceStatus>,
}

impl Default for VmStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl VmStatus {
    /// A freshly accepted spec starts in `Pending` with `Ready` unknown.
    pub fn new() -> Self {
        VmStatus {
            phase: Phase::Pending,
            conditions: vec![Condition {
                kind: ConditionKind::Ready,
                status: ConditionStatus::Unknown,
                reason: "Pending".into(),
                message: "spec accepted, not yet provisioned".into(),
                last_transition: utc_timestamp(),
            }],
            domain_uuid: None,
            interfaces: Vec::new(),
        }
    }

    /// Apply a transition if the table allows it. On a disallowed edge the
    /// phase is left unchanged and an error is returned.
    pub fn transition_to(&mut self, target: Phase) -> Result<(), ForgeError> {
        let allowed = match target {
            Phase::Pending => false,
            Phase::Creating => self.phase == Phase::Pending,
            Phase::Running => matches!(self.phase, Phase::Creating | Phase::Stopped),
            Phase::Stopping => self.phase == Phase::Running,
            // Running → Stopped covers forced stop without a graceful window.
            Phase::Stopped => matches!(self.phase, Phase::Stopping | Phase::Running),
            Phase::Failed => !self.phase.is_terminal(),
        };
        if !allowed {
            return Err(ForgeError::validation(format!(
                "illegal phase transition {} -> {}",
                self.phase, target
            )));
        }

        self.phase = target;
        match target {
            Phase::Creating => self.set_ready(ConditionStatus::False, "Creating", "provisioning in progress"),
            Phase::Running => self.set_ready(ConditionStatus::True, "VirtualMachineRunning", "domain is running"),
            Phase::Stopping => self.set_ready(ConditionStatus::False, "Stopping", "graceful shutdown requested"),
            Phase::Stopped => self.set_ready(ConditionStatus::False, "Stopped", "domain is shut off"),
            Phase::Failed => self.set_ready(ConditionStatus::False, "Failed", "lifecycle operation failed"),
            Phase::Pending => unreachable!("rejected above"),
        }
        Ok(())
    }

    /// The escape hatch: unconditionally applicable, records the caller's
    /// reason and message on the `Ready` condition. This is the only
    /// transition that cannot fail.
    pub fn transition_to_failed(&mut self, reason: &str, message: &str) {
        self.phase = Phase::Failed;
        self.set_ready(ConditionStatus::False, reason, message);
    }

    /// The `Ready` condition, if present.
    pub fn ready(&self) -> Option<&Condition> {
        self.condition(ConditionKind::Ready)
    }

    pub fn condition(&self, kind: ConditionKind) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }

    fn set_ready(&mut self, status: ConditionStatus, reason: &str, message: &str) {
        let stamp = utc_timestamp();
        match self.conditions.iter_mut().find(|c| c.kind == ConditionKind::Ready) {
            Some(c) => {
                c.status = status;
                c.reason = reason.into();
                c.message = message.into();
                c.last_transition = stamp;
            }
            None => self.conditions.push(Condition {
                kind: ConditionKind::Ready,
                status,
                reason: reason.into(),
                message: message.into(),
                last_transition: stamp,
            }),
        }
    }
}

/// Current UTC time as `YYYY-MM-DDTHH:MM:SSZ`, no datetime dependency.
pub fn utc_timestamp() -> String {
    let secs = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let (hh, mm, ss) = (secs % 86400 / 3600, secs % 3600 / 60, secs % 60);

    // Civil date from days since epoch (Howard Hinnant's civil_from_days).
    let z = (secs / 86400) as i64 + 719468;
    let era = z.div_euclid(146097);
    let doe = z.rem_euclid(146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = yoe as i64 + era * 400 + if m <= 2 { 1 } else { 0 };

    format!("{y:04}-{m:02}-{d:02}T{hh:02}:{mm:02}:{ss:02}Z")
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Phase; 6] = [
        Phase::Pending,
        Phase::Creating,
        Phase::Running,
        Phase::Stopping,
        Phase::Stopped,
        Phase::Failed,
    ];

    fn status_in(phase: Phase) -> VmStatus {
        let mut s = VmStatus::new();
        s.phase = phase;
        s
    }

    fn allowed(from: Phase, to: Phase) -> bool {
        match to {
            Phase::Pending => false,
            Phase::Creating => from == Phase::Pending,
            Phase::Running => matches!(from, Phase::Creating | Phase::Stopped),
            Phase::Stopping => from == Phase::Running,
            Phase::Stopped => matches!(from, Phase::Stopping | Phase::Running),
            Phase::Failed => from != Phase::Failed,
        }
    }

    #[test]
    fn full_lifecycle_succeeds() {
        let mut s = VmStatus::new();
        s.transition_to(Phase::Creating).unwrap();
        s.transition_to(Phase::Running).unwrap();
        assert_eq!(s.ready().unwrap().status, ConditionStatus::True);
        s.transition_to(Phase::Stopping).unwrap();
        s.transition_to(Phase::Stopped).unwrap();
        assert_eq!(s.phase, Phase::Stopped);
        assert_eq!(s.ready().unwrap().status, ConditionStatus::False);
    }

    #[test]
    fn restart_from_stopped() {
        let mut s = status_in(Phase::Stopped);
        s.transition_to(Phase::Running).unwrap();
        assert_eq!(s.phase, Phase::Running);
    }

    #[test]
    fn forced_stop_from_running() {
        let mut s = status_in(Phase::Running);
        s.transition_to(Phase::Stopped).unwrap();
        assert_eq!(s.phase, Phase::Stopped);
    }

    #[test]
    fn disallowed_edges_leave_phase_unchanged() {
        for from in ALL {
            for to in ALL {
                if allowed(from, to) {
                    continue;
                }
                let mut s = status_in(from);
                let err = s.transition_to(to).unwrap_err();
                assert!(
                    matches!(err, ForgeError::Validation { .. }),
                    "{from} -> {to} should be a validation error"
                );
                assert_eq!(s.phase, from, "{from} -> {to} must not change phase");
            }
        }
    }

    #[test]
    fn allowed_edges_match_table() {
        for from in ALL {
            for to in ALL {
                if !allowed(from, to) {
                    continue;
                }
                let mut s = status_in(from);
                s.transition_to(to).unwrap();
                assert_eq!(s.phase, to);
            }
        }
    }

    #[test]
    fn failed_records_reason_and_message() {
        for from in ALL {
            if from.is_terminal() {
                continue;
            }
            let mut s = status_in(from);
            s.transition_to_failed("VolumeCreateFailed", "pool is out of space");
            assert_eq!(s.phase, Phase::Failed);
            let ready = s.ready().unwrap();
            assert_eq!(ready.status, ConditionStatus::False);
            assert_eq!(ready.reason, "VolumeCreateFailed");
            assert_eq!(ready.message, "pool is out of space");
        }
    }

    #[test]
    fn failed_has_no_outgoing_edges() {
        for to in ALL {
            let mut s = status_in(Phase::Failed);
            assert!(s.transition_to(to).is_err(), "Failed -> {to} must be rejected");
        }
    }

    #[test]
    fn timestamp_shape() {
        let ts = utc_timestamp();
        assert_eq!(ts.len(), 20);
        assert!(ts.ends_with('Z'));
        assert!(ts.starts_with("20"));
    }
}
