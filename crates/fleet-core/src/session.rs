//! Per-agent session state: the operation queue and status slot.
//!
//! A session is private to its entry in the registry's table; callers go
//! through `enqueue`, `snapshot` and `report_status` and never hold a
//! reference to the queue itself.

use std::collections::VecDeque;

use fleet_crypto::token::AgentToken;
use fleet_protocol::{
    LifecycleState, Operation, OperationKind, OperationState, OperationStatus, UpdateCounters,
};

use crate::error::FleetError;

/// Upper bound on pending operations per agent. Enqueue past it is
/// rejected as resource exhaustion rather than growing without limit.
pub const QUEUE_BOUND: usize = 1024;

pub struct AgentSession {
    pub token: AgentToken,
    pub state: LifecycleState,
    pub counters: Option<UpdateCounters>,
    pub last_heartbeat_ms: u64,
    queue: VecDeque<Operation>,
    next_sequence: u64,
    status: OperationStatus,
}

impl AgentSession {
    pub fn new(token: AgentToken, now_ms: u64) -> Self {
        Self {
            token,
            state: LifecycleState::Online,
            counters: None,
            last_heartbeat_ms: now_ms,
            queue: VecDeque::new(),
            next_sequence: 0,
            status: OperationStatus::default(),
        }
    }

    /// Append an operation, assigning the next per-agent sequence number.
    pub fn enqueue(
        &mut self,
        kind: OperationKind,
        payload: serde_json::Value,
    ) -> Result<u64, FleetError> {
        if self.queue.len() >= QUEUE_BOUND {
            return Err(FleetError::QueueFull(self.token.agent_id));
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.queue.push_back(Operation {
            sequence,
            kind,
            payload,
        });
        Ok(sequence)
    }

    /// Read-only ordered view of the pending queue.
    pub fn snapshot(&self) -> Vec<Operation> {
        self.queue.iter().cloned().collect()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn status(&self) -> &OperationStatus {
        &self.status
    }

    /// Apply a status report from the agent.
    ///
    /// IN_PROGRESS hands off the queue head by position, whatever sequence
    /// number the agent reported; the wire protocol identifies the current
    /// operation positionally. A mismatch is logged so a misbehaving agent
    /// shows up in the audit trail.
    pub fn report_status(&mut self, sequence: u64, state: OperationState, message: String) {
        match state {
            OperationState::InProgress => {
                if let Some(head) = self.queue.pop_front() {
                    if head.sequence != sequence {
                        tracing::warn!(
                            agent_id = %self.token.agent_id,
                            reported = sequence,
                            head = head.sequence,
                            "in-progress report did not match queue head"
                        );
                    }
                }
                self.status = OperationStatus {
                    active_sequence: Some(sequence),
                    state,
                    message,
                };
            }
            OperationState::Idle => {
                self.status = OperationStatus::default();
            }
            OperationState::Success | OperationState::Failed => {
                self.status = OperationStatus {
                    active_sequence: Some(sequence),
                    state,
                    message,
                };
            }
        }
    }

    pub fn heartbeat(&mut self, now_ms: u64, counters: UpdateCounters) {
        self.last_heartbeat_ms = now_ms;
        self.counters = Some(counters);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn session() -> AgentSession {
        AgentSession::new(
            AgentToken {
                server_id: "srv".into(),
                agent_id: Uuid::new_v4(),
                issued_at_ms: 0,
                ttl_ms: 1_800_000,
            },
            0,
        )
    }

    #[test]
    fn sequences_start_at_zero_and_increment() {
        let mut s = session();
        let obj = serde_json::json!({});
        assert_eq!(s.enqueue(OperationKind::Update, obj.clone()).unwrap(), 0);
        assert_eq!(s.enqueue(OperationKind::Reboot, obj.clone()).unwrap(), 1);
        assert_eq!(s.enqueue(OperationKind::Shutdown, obj).unwrap(), 2);
        let snapshot = s.snapshot();
        assert_eq!(
            snapshot.iter().map(|op| op.sequence).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn in_progress_pops_fifo() {
        let mut s = session();
        for _ in 0..3 {
            s.enqueue(OperationKind::Update, serde_json::json!({})).unwrap();
        }
        for expected in [0u64, 1, 2] {
            let head = s.snapshot()[0].sequence;
            assert_eq!(head, expected);
            s.report_status(expected, OperationState::InProgress, String::new());
        }
        assert_eq!(s.queue_len(), 0);
        assert_eq!(s.status().state, OperationState::InProgress);
    }

    #[test]
    fn in_progress_pops_head_even_on_mismatched_sequence() {
        let mut s = session();
        s.enqueue(OperationKind::Update, serde_json::json!({})).unwrap();
        s.enqueue(OperationKind::Reboot, serde_json::json!({})).unwrap();
        // Agent reports a stale sequence; the head still goes.
        s.report_status(99, OperationState::InProgress, String::new());
        assert_eq!(s.queue_len(), 1);
        assert_eq!(s.snapshot()[0].sequence, 1);
        assert_eq!(s.status().active_sequence, Some(99));
    }

    #[test]
    fn snapshot_does_not_drain() {
        let mut s = session();
        s.enqueue(OperationKind::Update, serde_json::json!({})).unwrap();
        assert_eq!(s.snapshot().len(), 1);
        assert_eq!(s.snapshot().len(), 1);
        assert_eq!(s.queue_len(), 1);
    }

    #[test]
    fn idle_clears_the_status_slot() {
        let mut s = session();
        s.enqueue(OperationKind::Update, serde_json::json!({})).unwrap();
        s.report_status(0, OperationState::InProgress, "working".into());
        s.report_status(0, OperationState::Success, "done".into());
        assert_eq!(s.status().state, OperationState::Success);
        s.report_status(0, OperationState::Idle, String::new());
        assert_eq!(s.status().state, OperationState::Idle);
        assert!(s.status().active_sequence.is_none());
    }

    #[test]
    fn success_report_does_not_touch_the_queue() {
        let mut s = session();
        s.enqueue(OperationKind::Update, serde_json::json!({})).unwrap();
        s.report_status(0, OperationState::Success, "done".into());
        assert_eq!(s.queue_len(), 1);
    }

    #[test]
    fn enqueue_is_bounded() {
        let mut s = session();
        for _ in 0..QUEUE_BOUND {
            s.enqueue(OperationKind::Update, serde_json::json!({})).unwrap();
        }
        let err = s
            .enqueue(OperationKind::Update, serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, FleetError::QueueFull(_)));
        assert_eq!(s.queue_len(), QUEUE_BOUND);
    }

    #[test]
    fn heartbeat_updates_liveness_and_counters() {
        let mut s = session();
        s.heartbeat(
            42,
            UpdateCounters {
                updates: 3,
                security_updates: 1,
            },
        );
        assert_eq!(s.last_heartbeat_ms, 42);
        assert_eq!(s.counters.unwrap().security_updates, 1);
    }
}
