//! Provisioning state machine
//!
//! Sequences scan, validation, acquisition, the raw write and manifest
//! injection. Two confirmations gate the run: one after the device is
//! validated and one immediately before the write. Neither can be skipped.
//! Image acquisition starts as soon as the image is resolved and overlaps
//! with device selection; the write waits for both a confirmed device and a
//! verified image. Caller decisions run on the blocking pool and are abandoned
//! as soon as the run is cancelled.

use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core::acquire::{AcquireOptions, ImageAcquirer};
use crate::core::catalog::{ImageCatalog, ImageDescriptor, ImageRequest};
use crate::core::device::{DeviceRecord, DeviceScanner};
use crate::core::manifest::{Manifest, ManifestInjector};
use crate::core::validator::DeviceValidator;
use crate::core::writer::{DeviceWriter, WriteJob, WriteProgress, WriteResult, WriteStatus};
use crate::error::ProvisionError;

/// States of one provisioning run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionState {
    Idle,
    Scanning,
    AwaitingSelection,
    Validating,
    AwaitingConfirmation,
    Acquiring,
    AwaitingFinalConfirmation,
    Writing,
    Verifying,
    InjectingManifest,
    Complete,
    Cancelled,
    Failed,
}

impl ProvisionState {
    /// Whether the run has ended
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled | Self::Failed)
    }

    fn successor(self) -> Option<Self> {
        Some(match self {
            Self::Idle => Self::Scanning,
            Self::Scanning => Self::AwaitingSelection,
            Self::AwaitingSelection => Self::Validating,
            Self::Validating => Self::AwaitingConfirmation,
            Self::AwaitingConfirmation => Self::Acquiring,
            Self::Acquiring => Self::AwaitingFinalConfirmation,
            Self::AwaitingFinalConfirmation => Self::Writing,
            Self::Writing => Self::Verifying,
            Self::Verifying => Self::InjectingManifest,
            Self::InjectingManifest => Self::Complete,
            Self::Complete | Self::Cancelled | Self::Failed => return None,
        })
    }

    /// Whether `next` directly follows this state
    ///
    /// Runs only move forward one step at a time; `Cancelled` and `Failed`
    /// are reachable from every non-terminal state.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        matches!(next, Self::Cancelled | Self::Failed) || self.successor() == Some(next)
    }
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::AwaitingSelection => "awaiting selection",
            Self::Validating => "validating",
            Self::AwaitingConfirmation => "awaiting confirmation",
            Self::Acquiring => "acquiring image",
            Self::AwaitingFinalConfirmation => "awaiting final confirmation",
            Self::Writing => "writing",
            Self::Verifying => "verifying",
            Self::InjectingManifest => "injecting manifest",
            Self::Complete => "complete",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Which confirmation is being asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationStage {
    /// The user picked this device
    DeviceSelected,
    /// Last chance before the device is overwritten
    FinalWrite,
}

/// Context shown with a confirmation
#[derive(Debug, Clone, Copy)]
pub struct ConfirmationPrompt<'a> {
    pub stage: ConfirmationStage,
    pub device: &'a DeviceRecord,
    pub image: &'a ImageDescriptor,
}

/// Caller-side decisions and notifications
///
/// The orchestrator never renders anything; it only relies on these return
/// values. `select_device` and `confirm` may block on user input.
pub trait ProvisionCallbacks: Send + Sync {
    /// Pick one of the suitable devices, or `None` to cancel
    fn select_device(&self, candidates: &[DeviceRecord]) -> Option<DeviceRecord>;

    /// Approve the prompt; `false` cancels the run
    fn confirm(&self, prompt: &ConfirmationPrompt<'_>) -> bool;

    /// Raw write progress
    fn on_write_progress(&self, bytes_written: u64, total_bytes: u64);

    /// State changes
    fn on_state(&self, _state: ProvisionState) {}

    /// Image download progress
    fn on_download(&self, _downloaded: u64, _total: u64) {}
}

/// What the caller asked to provision
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub image: ImageRequest,
    pub module_name: String,
    pub services: Vec<(String, u16)>,
    pub acquire: AcquireOptions,
}

impl Default for ProvisionRequest {
    fn default() -> Self {
        let manifest = Manifest::default();
        Self {
            image: ImageRequest::default(),
            module_name: manifest.module_name,
            services: manifest
                .services
                .into_iter()
                .map(|(name, spec)| (name, spec.port))
                .collect(),
            acquire: AcquireOptions::default(),
        }
    }
}

/// How a run ended, when it did not fail
#[derive(Debug)]
pub enum ProvisionOutcome {
    /// Device written and verified; the manifest may still be missing
    Complete {
        device: DeviceRecord,
        image: ImageDescriptor,
        write: WriteResult,
        manifest_error: Option<ProvisionError>,
    },
    /// Stopped by the user or the cancellation token
    Cancelled {
        at: ProvisionState,
        bytes_written: u64,
    },
}

struct StateMachine {
    state: ProvisionState,
    callbacks: Arc<dyn ProvisionCallbacks>,
}

impl StateMachine {
    fn advance(&mut self, next: ProvisionState) -> Result<(), ProvisionError> {
        if !self.state.can_transition_to(next) {
            return Err(ProvisionError::Internal(format!(
                "illegal transition from {} to {next}",
                self.state
            )));
        }
        tracing::info!(from = %self.state, to = %next, "Provisioning state");
        self.state = next;
        self.callbacks.on_state(next);
        Ok(())
    }

    fn cancel(&mut self, bytes_written: u64) -> Result<ProvisionOutcome, ProvisionError> {
        let at = self.state;
        self.advance(ProvisionState::Cancelled)?;
        Ok(ProvisionOutcome::Cancelled { at, bytes_written })
    }
}

/// Forwards writer progress to the callbacks and its status to the run
struct CallbackProgress {
    callbacks: Arc<dyn ProvisionCallbacks>,
    status: mpsc::UnboundedSender<WriteStatus>,
}

impl WriteProgress for CallbackProgress {
    fn on_chunk(&self, bytes_written: u64, total_bytes: u64) {
        self.callbacks.on_write_progress(bytes_written, total_bytes);
    }

    fn on_status(&self, status: WriteStatus) {
        // The receiver is gone only once the run has ended
        let _ = self.status.send(status);
    }
}

/// Owns the pipeline components for the lifetime of the process
pub struct ProvisioningOrchestrator {
    scanner: DeviceScanner,
    validator: DeviceValidator,
    catalog: ImageCatalog,
    acquirer: Arc<ImageAcquirer>,
    writer: Arc<DeviceWriter>,
    injector: Arc<ManifestInjector>,
}

impl ProvisioningOrchestrator {
    pub fn new(
        scanner: DeviceScanner,
        validator: DeviceValidator,
        catalog: ImageCatalog,
        acquirer: ImageAcquirer,
        writer: DeviceWriter,
        injector: ManifestInjector,
    ) -> Self {
        Self {
            scanner,
            validator,
            catalog,
            acquirer: Arc::new(acquirer),
            writer: Arc::new(writer),
            injector: Arc::new(injector),
        }
    }

    /// Run one provisioning attempt to a terminal state
    pub async fn run(
        &self,
        request: &ProvisionRequest,
        callbacks: Arc<dyn ProvisionCallbacks>,
        cancel: &CancellationToken,
    ) -> Result<ProvisionOutcome, ProvisionError> {
        let mut machine = StateMachine {
            state: ProvisionState::Idle,
            callbacks: callbacks.clone(),
        };
        match self.drive(&mut machine, request, callbacks, cancel).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::error!(state = %machine.state, error = %e, "Provisioning failed");
                if !machine.state.is_terminal() {
                    machine.advance(ProvisionState::Failed)?;
                }
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        machine: &mut StateMachine,
        request: &ProvisionRequest,
        callbacks: Arc<dyn ProvisionCallbacks>,
        cancel: &CancellationToken,
    ) -> Result<ProvisionOutcome, ProvisionError> {
        let descriptor = self.catalog.resolve(&request.image).await?;

        // Stops the background download whenever this run ends early
        let acquire_token = cancel.child_token();
        let _stop_acquisition = acquire_token.clone().drop_guard();
        let acquisition = {
            let acquirer = self.acquirer.clone();
            let descriptor = descriptor.clone();
            let options = request.acquire;
            let callbacks = callbacks.clone();
            tokio::spawn(async move {
                let progress: crate::infra::download::ProgressCallback =
                    Box::new(move |done, total| callbacks.on_download(done, total));
                acquirer
                    .acquire(&descriptor, options, &acquire_token, Some(progress))
                    .await
            })
        };

        machine.advance(ProvisionState::Scanning)?;
        let records = self.scanner.scan()?;
        let candidates: Vec<DeviceRecord> = self
            .validator
            .assess_all(&records)
            .into_iter()
            .filter(DeviceRecord::is_suitable)
            .collect();
        if candidates.is_empty() {
            return Err(ProvisionError::NoSuitableDevice {
                scanned: records.len(),
            });
        }

        machine.advance(ProvisionState::AwaitingSelection)?;
        if cancel.is_cancelled() {
            return machine.cancel(0);
        }
        let picker = callbacks.clone();
        let offered = candidates.clone();
        let Some(Some(chosen)) = ask(cancel, move || picker.select_device(&offered)).await? else {
            return machine.cancel(0);
        };
        if !candidates.iter().any(|c| c.path() == chosen.path()) {
            return Err(ProvisionError::ValidationFailed {
                device: chosen.path().to_string(),
                reason: "not one of the suitable devices offered".to_string(),
            });
        }

        machine.advance(ProvisionState::Validating)?;
        let device = self.revalidate(&chosen)?;

        machine.advance(ProvisionState::AwaitingConfirmation)?;
        let stage = ConfirmationStage::DeviceSelected;
        if !confirmed(&callbacks, stage, &device, &descriptor, cancel).await? {
            return machine.cancel(0);
        }

        machine.advance(ProvisionState::Acquiring)?;
        let acquired = tokio::select! {
            () = cancel.cancelled() => return machine.cancel(0),
            joined = acquisition => joined
                .map_err(|e| ProvisionError::Internal(format!("acquisition task: {e}")))?,
        };
        let image = match acquired {
            Ok(entry) => entry.into_verified()?,
            Err(ProvisionError::Cancelled { .. }) => return machine.cancel(0),
            Err(e) => return Err(e),
        };

        machine.advance(ProvisionState::AwaitingFinalConfirmation)?;
        let stage = ConfirmationStage::FinalWrite;
        if !confirmed(&callbacks, stage, &device, &descriptor, cancel).await? {
            return machine.cancel(0);
        }

        machine.advance(ProvisionState::Writing)?;
        let (status_tx, mut status_rx) = mpsc::unbounded_channel();
        let mut task = {
            let writer = self.writer.clone();
            let job = WriteJob::new(image, device.clone());
            let progress = CallbackProgress {
                callbacks: callbacks.clone(),
                status: status_tx,
            };
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || writer.write(job, &progress, &cancel))
        };
        // The writer verifies internally; mirror its status while it runs
        let joined = loop {
            tokio::select! {
                Some(status) = status_rx.recv() => follow_writer(machine, status)?,
                joined = &mut task => break joined,
            }
        };
        while let Ok(status) = status_rx.try_recv() {
            follow_writer(machine, status)?;
        }
        let write =
            joined.map_err(|e| ProvisionError::Internal(format!("write task: {e}")))??;
        if write.status == WriteStatus::Cancelled {
            return machine.cancel(write.bytes_written);
        }
        tracing::debug!(
            device = %write.device,
            flushed = write.flushed_bytes,
            "Read-back verified"
        );

        machine.advance(ProvisionState::InjectingManifest)?;
        let manifest = Manifest::new(&request.module_name, request.services.iter().cloned())
            .with_image(&descriptor);
        let injector = self.injector.clone();
        let path = device.path().to_string();
        let injected = tokio::task::spawn_blocking(move || injector.inject(&path, &manifest)).await;
        let manifest_error = match injected {
            Ok(Ok(_)) => None,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Module manifest was not written");
                Some(e)
            }
            Err(e) => Some(ProvisionError::ManifestError {
                device: device.path().to_string(),
                reason: e.to_string(),
            }),
        };

        machine.advance(ProvisionState::Complete)?;
        Ok(ProvisionOutcome::Complete {
            device,
            image: descriptor,
            write,
            manifest_error,
        })
    }

    /// Fresh, still-suitable record for the selected device
    fn revalidate(&self, chosen: &DeviceRecord) -> Result<DeviceRecord, ProvisionError> {
        let records = self.scanner.scan()?;
        let current = records
            .iter()
            .find(|r| r.path() == chosen.path())
            .ok_or_else(|| ProvisionError::DeviceChanged {
                device: chosen.path().to_string(),
                reason: "device is no longer present".to_string(),
            })?;
        if let Some(reason) = chosen.identity_mismatch(current) {
            return Err(ProvisionError::DeviceChanged {
                device: chosen.path().to_string(),
                reason,
            });
        }
        let boot = self.validator.boot_device(&records);
        let assessed = self.validator.assess(current, boot.as_deref());
        if !assessed.is_suitable() {
            return Err(ProvisionError::ValidationFailed {
                device: chosen.path().to_string(),
                reason: assessed.suitability().reason().to_string(),
            });
        }
        Ok(assessed)
    }
}

/// Run a blocking caller decision on the blocking pool
///
/// Returns `None` when `cancel` fires first. The abandoned prompt is left to
/// finish on its own; its answer is ignored.
async fn ask<T, F>(cancel: &CancellationToken, decide: F) -> Result<Option<T>, ProvisionError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let mut task = tokio::task::spawn_blocking(decide);
    tokio::select! {
        () = cancel.cancelled() => Ok(None),
        joined = &mut task => joined
            .map(Some)
            .map_err(|e| ProvisionError::Internal(format!("prompt task: {e}"))),
    }
}

async fn confirmed(
    callbacks: &Arc<dyn ProvisionCallbacks>,
    stage: ConfirmationStage,
    device: &DeviceRecord,
    image: &ImageDescriptor,
    cancel: &CancellationToken,
) -> Result<bool, ProvisionError> {
    if cancel.is_cancelled() {
        return Ok(false);
    }
    let callbacks = callbacks.clone();
    let (device, image) = (device.clone(), image.clone());
    let answer = ask(cancel, move || {
        callbacks.confirm(&ConfirmationPrompt {
            stage,
            device: &device,
            image: &image,
        })
    })
    .await?;
    Ok(answer == Some(true))
}

/// Advance the run when the writer moves on to read-back verification
fn follow_writer(machine: &mut StateMachine, status: WriteStatus) -> Result<(), ProvisionError> {
    if status == WriteStatus::Verifying {
        machine.advance(ProvisionState::Verifying)?;
    }
    Ok(())
}
