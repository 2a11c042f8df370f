//! Capture sessions against the shared capture device.
//!
//! The capture device is a single shared resource: a [`CaptureStation`] hands
//! out at most one [`CaptureSession`] at a time. A session is one
//! request/response cycle, closed when the device answers, fails, or exceeds
//! the capture timeout.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::timeout;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{ScanError, ScanResult};
use crate::hardware::{Artifact, CaptureDevice};

/// A successful capture, kept for the run's capture set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRecord {
    /// Plan step the capture belongs to
    pub step_index: usize,
    /// Session request id
    pub request_id: Uuid,
    /// Device-provided artifact handle
    pub artifact: Artifact,
    /// When the request was issued
    pub requested_at: DateTime<Utc>,
    /// When the device answered
    pub completed_at: DateTime<Utc>,
    /// Axis positions the capture was taken at
    pub positions: BTreeMap<String, i32>,
}

/// Serializes access to one capture device.
pub struct CaptureStation {
    name: String,
    device: Arc<dyn CaptureDevice>,
    timeout: Duration,
    gate: Arc<Mutex<()>>,
}

impl std::fmt::Debug for CaptureStation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureStation")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl CaptureStation {
    /// Wrap `device`, bounding every capture by `timeout`.
    pub fn new(name: impl Into<String>, device: Arc<dyn CaptureDevice>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            device,
            timeout,
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// Device name used in faults and logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open a session for `step_index`, waiting for any outstanding one to close.
    pub async fn open(&self, step_index: usize) -> CaptureSession {
        let permit = self.gate.clone().lock_owned().await;
        let session = CaptureSession {
            request_id: Uuid::new_v4(),
            step_index,
            opened_at: Utc::now(),
            device_name: self.name.clone(),
            device: self.device.clone(),
            timeout: self.timeout,
            _permit: permit,
        };
        debug!(step = step_index, request_id = %session.request_id, "Capture session opened");
        session
    }

    /// Open a session and run it to completion.
    pub async fn capture(
        &self,
        step_index: usize,
        positions: BTreeMap<String, i32>,
    ) -> ScanResult<CaptureRecord> {
        self.open(step_index).await.run(positions).await
    }
}

/// One outstanding capture request.
///
/// Holds the station's permit until it is run or dropped.
pub struct CaptureSession {
    request_id: Uuid,
    step_index: usize,
    opened_at: DateTime<Utc>,
    device_name: String,
    device: Arc<dyn CaptureDevice>,
    timeout: Duration,
    _permit: OwnedMutexGuard<()>,
}

impl CaptureSession {
    /// Request id.
    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Plan step this session captures.
    pub fn step_index(&self) -> usize {
        self.step_index
    }

    /// When the session was opened.
    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Issue the capture and close the session.
    ///
    /// # Errors
    /// - `CaptureTimeout` if the device does not answer within the timeout
    /// - `CaptureDevice` if the device reports a failure
    pub async fn run(self, positions: BTreeMap<String, i32>) -> ScanResult<CaptureRecord> {
        let artifact = match timeout(self.timeout, self.device.capture()).await {
            Ok(Ok(artifact)) => artifact,
            Ok(Err(e)) => {
                return Err(ScanError::CaptureDevice {
                    device: self.device_name,
                    message: format!("{e:#}"),
                })
            }
            Err(_) => {
                return Err(ScanError::CaptureTimeout {
                    device: self.device_name,
                    timeout: self.timeout,
                })
            }
        };

        info!(step = self.step_index, %artifact, "Captured");
        Ok(CaptureRecord {
            step_index: self.step_index,
            request_id: self.request_id,
            artifact,
            requested_at: self.opened_at,
            completed_at: Utc::now(),
            positions,
        })
    }
}
