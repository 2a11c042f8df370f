//! Event stream emitted by a running scan.
//!
//! Events are delivered in step order over bounded channels. A slow subscriber
//! stalls the run rather than losing events.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::fault::FaultRecord;
use crate::hardware::Artifact;
use crate::orchestrator::RunStatus;

/// One entry in the run's event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ScanEvent {
    /// Motion for step `index` is about to begin
    StepStarted {
        /// Step index
        index: usize,
    },
    /// Step `index` produced an artifact
    StepCaptured {
        /// Step index
        index: usize,
        /// Capture result
        artifact: Artifact,
    },
    /// Step `index` raised a fault
    StepFaulted {
        /// Step index
        index: usize,
        /// Classified fault
        fault: FaultRecord,
    },
    /// The run moved to a new status
    RunStatusChanged {
        /// New status
        status: RunStatus,
    },
}

impl ScanEvent {
    /// Step index for step events.
    pub fn step_index(&self) -> Option<usize> {
        match self {
            ScanEvent::StepStarted { index }
            | ScanEvent::StepCaptured { index, .. }
            | ScanEvent::StepFaulted { index, .. } => Some(*index),
            ScanEvent::RunStatusChanged { .. } => None,
        }
    }

    /// Whether the event closes a step (captured or faulted).
    pub fn is_step_outcome(&self) -> bool {
        matches!(
            self,
            ScanEvent::StepCaptured { .. } | ScanEvent::StepFaulted { .. }
        )
    }
}

/// Fan-out of events to every live subscriber.
#[derive(Debug)]
pub(crate) struct EventBus {
    capacity: usize,
    subscribers: parking_lot::Mutex<Vec<mpsc::Sender<ScanEvent>>>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(&self) -> mpsc::Receiver<ScanEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver `event` to every subscriber, waiting for room in each channel.
    ///
    /// Subscribers whose receiver was dropped are pruned.
    pub(crate) async fn emit(&self, event: ScanEvent) {
        let subscribers = self.subscribers.lock().clone();
        let mut closed = false;
        for tx in &subscribers {
            if tx.send(event.clone()).await.is_err() {
                closed = true;
            }
        }
        if closed {
            self.subscribers.lock().retain(|tx| !tx.is_closed());
        }
    }
}
