//! Events leaving the pipeline: lifecycle updates for the UI/host layer and
//! usage records for billing.
//!
//! Both are fire-and-forget. A UI that went away or a billing sink that
//! fails never affects the call.

use crate::error::ErrorCategory;
use crate::orchestrator::TurnState;
use crate::providers::ProviderCallCounts;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// What the UI shows for the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UiState {
    Calibrating,
    Listening,
    Transcribing,
    Thinking,
    Speaking,
    Ending,
    Error,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    State {
        session_id: Uuid,
        state: UiState,
    },
    /// Final transcript of the user's utterance.
    Transcript { turn_id: u64, text: String },
    /// Response text so far, for live captions.
    ResponseText { turn_id: u64, text: String },
    Error {
        category: ErrorCategory,
        message: String,
        turn_id: Option<u64>,
    },
    TurnFinished { turn_id: u64, state: TurnState },
}

/// Sender side of the UI event channel. Cheap to clone; a missing or closed
/// receiver is ignored.
#[derive(Debug, Clone, Default)]
pub struct EventEmitter {
    tx: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl EventEmitter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// An emitter that drops everything.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                debug!("UI event receiver dropped");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Hangup,
    MaxDuration,
    NotAllowed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BillingEvent {
    CallStarted {
        session_id: Uuid,
    },
    TurnCompleted {
        session_id: Uuid,
        turn_id: u64,
        provider_call_counts: ProviderCallCounts,
        outcome: TurnState,
    },
    CallEnded {
        session_id: Uuid,
        duration_ms: i64,
        reason: EndReason,
    },
}

/// Usage sink. Must return quickly; it is called from the call's hot path.
pub trait BillingSink: Send + Sync {
    fn emit(&self, event: BillingEvent);
}

/// Writes billing events to the log as JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingBillingSink;

impl BillingSink for TracingBillingSink {
    fn emit(&self, event: BillingEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => info!(target: "parley::billing", "{}", json),
            Err(e) => debug!(target: "parley::billing", "Unserializable billing event: {}", e),
        }
    }
}

/// Forwards billing events to a channel (host-side metering, tests).
#[derive(Debug, Clone)]
pub struct ChannelBillingSink {
    tx: mpsc::UnboundedSender<BillingEvent>,
}

impl ChannelBillingSink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<BillingEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl BillingSink for ChannelBillingSink {
    fn emit(&self, event: BillingEvent) {
        let _ = self.tx.send(event);
    }
}
