use crate::plan::{Plan, Progress};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Direct,
    Plan,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallSummary {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Everything a run can tell the edge, as one tagged union. The edge lowers
/// frames to line-delimited JSON; consumers dispatch on `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    ResponseStart {
        mode: RunMode,
    },
    PlanCreated {
        plan: Plan,
    },
    PlanAwaitingApproval {
        plan: Plan,
    },
    PlanApproved,
    PlanRejected {
        reason: String,
    },
    PlanModified {
        plan: Plan,
    },
    PlanExecutionStarted {
        plan: Plan,
    },
    PlanExecutionCompleted {
        plan: Plan,
        summary: String,
    },
    PlanExecutionFailed {
        step_id: Option<u32>,
        error: String,
    },
    PlanExecutionCancelled {
        message: String,
    },
    StepStarted {
        step_id: u32,
        description: String,
        progress: Progress,
    },
    StepOutput {
        step_id: u32,
        content: String,
    },
    ToolCalls {
        step_id: Option<u32>,
        calls: Vec<ToolCallSummary>,
    },
    ToolResult {
        step_id: Option<u32>,
        tool_call_id: String,
        tool: String,
        success: bool,
        output_summary: String,
        error: Option<String>,
    },
    StepCompleted {
        step_id: u32,
        files_changed: Vec<String>,
        progress: Progress,
    },
    StepError {
        step_id: u32,
        error: String,
    },
    StepFailed {
        step_id: u32,
        error: String,
    },
    Token {
        content: String,
    },
    FileChange {
        path: String,
    },
    FileRunStarted {
        file: String,
    },
    FileRunStdout {
        content: String,
    },
    FileRunStderr {
        content: String,
    },
    FileRunExit {
        exit_code: i64,
        duration_ms: u64,
    },
    AnomalyDetected {
        step_id: Option<u32>,
        message: String,
    },
    ReplanWarning {
        message: String,
    },
    Status {
        message: String,
    },
    Error {
        kind: String,
        message: String,
    },
    ResponseEnd,
}

impl AgentEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ResponseStart { .. } => "response_start",
            Self::PlanCreated { .. } => "plan_created",
            Self::PlanAwaitingApproval { .. } => "plan_awaiting_approval",
            Self::PlanApproved => "plan_approved",
            Self::PlanRejected { .. } => "plan_rejected",
            Self::PlanModified { .. } => "plan_modified",
            Self::PlanExecutionStarted { .. } => "plan_execution_started",
            Self::PlanExecutionCompleted { .. } => "plan_execution_completed",
            Self::PlanExecutionFailed { .. } => "plan_execution_failed",
            Self::PlanExecutionCancelled { .. } => "plan_execution_cancelled",
            Self::StepStarted { .. } => "step_started",
            Self::StepOutput { .. } => "step_output",
            Self::ToolCalls { .. } => "tool_calls",
            Self::ToolResult { .. } => "tool_result",
            Self::StepCompleted { .. } => "step_completed",
            Self::StepError { .. } => "step_error",
            Self::StepFailed { .. } => "step_failed",
            Self::Token { .. } => "token",
            Self::FileChange { .. } => "file_change",
            Self::FileRunStarted { .. } => "file_run_started",
            Self::FileRunStdout { .. } => "file_run_stdout",
            Self::FileRunStderr { .. } => "file_run_stderr",
            Self::FileRunExit { .. } => "file_run_exit",
            Self::AnomalyDetected { .. } => "anomaly_detected",
            Self::ReplanWarning { .. } => "replan_warning",
            Self::Status { .. } => "status",
            Self::Error { .. } => "error",
            Self::ResponseEnd => "response_end",
        }
    }
}

/// One delivered unit: sequence number, wall-clock stamp, event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: AgentEvent,
}

struct BusInner {
    retention: usize,
    next_seq: u64,
    buffer: VecDeque<EventFrame>,
    evicted: u64,
    subscriber: Option<UnboundedSender<EventFrame>>,
}

/// Ordered single-producer event stream for one session. The producer never
/// blocks; frames are retained in a bounded ring so a consumer that
/// disconnects mid-run can reconnect and replay what it missed. Frames
/// evicted before any reconnect surface as a dropped-events marker.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

/// Producer handle; cheap to clone into background tasks.
#[derive(Clone)]
pub struct EventSink {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new(retention: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                retention: retention.max(1),
                next_seq: 1,
                buffer: VecDeque::new(),
                evicted: 0,
                subscriber: None,
            })),
        }
    }

    pub fn sink(&self) -> EventSink {
        EventSink {
            inner: self.inner.clone(),
        }
    }

    /// Attach a consumer: replays every retained frame in order, then
    /// streams live frames. A previous subscriber is disconnected.
    pub fn subscribe(&self) -> UnboundedReceiver<EventFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.evicted > 0 {
            let marker = EventFrame {
                seq: 0,
                timestamp: Utc::now(),
                event: AgentEvent::Status {
                    message: format!("{} earlier events dropped", inner.evicted),
                },
            };
            let _ = tx.send(marker);
        }
        for frame in &inner.buffer {
            let _ = tx.send(frame.clone());
        }
        inner.subscriber = Some(tx);
        rx
    }
}

impl EventSink {
    pub fn emit(&self, event: AgentEvent) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let frame = EventFrame {
            seq: inner.next_seq,
            timestamp: Utc::now(),
            event,
        };
        inner.next_seq += 1;

        if inner.buffer.len() >= inner.retention {
            inner.buffer.pop_front();
            inner.evicted += 1;
        }
        inner.buffer.push_back(frame.clone());

        let delivered = match &inner.subscriber {
            Some(tx) => tx.send(frame).is_ok(),
            None => true,
        };
        if !delivered {
            // Consumer went away; keep producing into the ring.
            inner.subscriber = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_arrive_in_emission_order() {
        let bus = EventBus::new(64);
        let sink = bus.sink();
        let mut rx = bus.subscribe();

        sink.emit(AgentEvent::ResponseStart { mode: RunMode::Direct });
        sink.emit(AgentEvent::Token { content: "hi".to_string() });
        sink.emit(AgentEvent::ResponseEnd);

        let kinds: Vec<&str> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|f| f.event.kind())
            .collect();
        assert_eq!(kinds, vec!["response_start", "token", "response_end"]);
    }

    #[test]
    fn sequence_numbers_are_strictly_increasing() {
        let bus = EventBus::new(64);
        let sink = bus.sink();
        let mut rx = bus.subscribe();
        for _ in 0..5 {
            sink.emit(AgentEvent::ResponseEnd);
        }
        let seqs: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|f| f.seq)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn reconnect_replays_retained_frames() {
        let bus = EventBus::new(64);
        let sink = bus.sink();
        {
            let _rx = bus.subscribe();
            sink.emit(AgentEvent::ResponseStart { mode: RunMode::Plan });
        }
        // Consumer dropped; production continues.
        sink.emit(AgentEvent::Status { message: "still going".to_string() });

        let mut rx = bus.subscribe();
        let kinds: Vec<&str> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|f| f.event.kind())
            .collect();
        assert_eq!(kinds, vec!["response_start", "status"]);
    }

    #[test]
    fn overflow_surfaces_dropped_marker_on_reconnect() {
        let bus = EventBus::new(2);
        let sink = bus.sink();
        for i in 0..5 {
            sink.emit(AgentEvent::Token { content: i.to_string() });
        }
        let mut rx = bus.subscribe();
        let first = rx.try_recv().unwrap();
        match first.event {
            AgentEvent::Status { message } => assert!(message.contains("3 earlier events dropped")),
            other => panic!("expected dropped marker, got {other:?}"),
        }
        let remaining: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|f| f.seq)
            .collect();
        assert_eq!(remaining, vec![4, 5]);
    }

    #[test]
    fn events_serialize_with_snake_case_tags() {
        let event = AgentEvent::FileRunExit {
            exit_code: -1,
            duration_ms: 5000,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "file_run_exit");
        assert_eq!(json["exit_code"], -1);
        assert_eq!(event.kind(), "file_run_exit");
    }
}
