// ── Download pipeline ──
//
// Puts a user program onto a micro:bit. Runs beside the connection flow:
// it may flash the session's own micro:bit or borrow a temporary USB
// handle to flash another one, and never touches the session's status.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mblink_api::{BoardVersion, DeviceConnectionStatus, HexData, UsbTransport};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tracing::{debug, info, warn};

use crate::actions::{ConnectActions, HexSource, SameDeviceFn};
use crate::error::CoreError;
use crate::manual::ManualDownload;
use crate::model::{ConnectionStatus, ConnectionType, DownloadState, DownloadStep, MicrobitToFlash};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Called once a temporary USB handle has been let go.
pub type ReleaseFn = Arc<dyn Fn() + Send + Sync>;

/// The session a download starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DownloadContext {
    pub connection_type: ConnectionType,
    pub connection_status: ConnectionStatus,
    /// Board of the session's micro:bit, when the connect flow saw it.
    pub board_version: Option<BoardVersion>,
}

// ── Temporary USB borrow ─────────────────────────────────────────────

/// A short-lived USB handle for flashing a micro:bit other than the
/// session's own. Holding it holds the pipeline's single borrow permit.
///
/// `release()` disconnects it; dropping it unreleased spawns the disconnect.
/// Either way the pipeline's release callback runs.
pub struct TemporaryUsb {
    usb: Arc<dyn UsbTransport>,
    released: bool,
    on_release: Option<ReleaseFn>,
    _permit: OwnedSemaphorePermit,
}

impl TemporaryUsb {
    pub fn usb(&self) -> &Arc<dyn UsbTransport> {
        &self.usb
    }

    pub async fn release(mut self) {
        if let Err(e) = self.usb.disconnect().await {
            warn!(error = %e, "closing temporary USB connection failed (non-fatal)");
        }
        self.released = true;
        if let Some(callback) = self.on_release.take() {
            callback();
        }
        debug!("temporary USB connection released");
    }
}

impl Drop for TemporaryUsb {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some(callback) = self.on_release.take() {
            callback();
        }
        let usb = Arc::clone(&self.usb);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = usb.disconnect().await {
                    warn!(error = %e, "closing temporary USB connection failed (non-fatal)");
                }
            });
        } else {
            warn!("temporary USB connection dropped outside a runtime; left open");
        }
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────

/// State machine over [`DownloadStep`].
pub struct DownloadPipeline {
    actions: Arc<ConnectActions>,
    manual: Arc<dyn ManualDownload>,
    state: watch::Sender<DownloadState>,
    context: Mutex<DownloadContext>,
    borrow: Arc<Semaphore>,
    temporary: Mutex<Option<TemporaryUsb>>,
    on_same_device: Option<SameDeviceFn>,
    on_borrow_released: Option<ReleaseFn>,
}

impl DownloadPipeline {
    pub fn new(actions: Arc<ConnectActions>, manual: Arc<dyn ManualDownload>, show_help: bool) -> Self {
        let (state, _) = watch::channel(DownloadState {
            show_help,
            ..DownloadState::default()
        });
        Self {
            actions,
            manual,
            state,
            context: Mutex::new(DownloadContext::default()),
            borrow: Arc::new(Semaphore::new(1)),
            temporary: Mutex::new(None),
            on_same_device: None,
            on_borrow_released: None,
        }
    }

    /// Called when a "different" micro:bit turns out to be the session's own.
    pub fn with_same_device_callback(mut self, callback: SameDeviceFn) -> Self {
        self.on_same_device = Some(callback);
        self
    }

    /// Called whenever a temporary USB borrow ends, on every exit path.
    pub fn with_borrow_release_callback(mut self, callback: ReleaseFn) -> Self {
        self.on_borrow_released = Some(callback);
        self
    }

    pub fn state(&self) -> DownloadState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DownloadState> {
        self.state.subscribe()
    }

    /// "Skip next time" on the help step.
    pub fn set_show_help(&self, show_help: bool) {
        self.state.send_modify(|s| s.show_help = show_help);
    }

    /// Begin downloading `hex`.
    ///
    /// A Bluetooth session whose micro:bit is still on USB is flashed
    /// straight away.
    pub async fn start(&self, hex: HexData, context: DownloadContext) -> Result<(), CoreError> {
        self.release_temporary().await;
        *lock(&self.context) = context;
        self.state.send_modify(|s| {
            *s = DownloadState {
                hex: Some(hex.clone()),
                show_help: s.show_help,
                ..DownloadState::default()
            };
        });
        info!(program = %hex.name, connection_type = %context.connection_type, "download started");

        let usb = Arc::clone(self.actions.usb());
        if context.connection_type == ConnectionType::Bluetooth
            && usb.status() == DeviceConnectionStatus::Connected
        {
            self.state.send_modify(|s| s.microbit_to_flash = MicrobitToFlash::Same);
            self.flash_on(&usb, &hex).await;
            return Ok(());
        }

        let step = if self.state.borrow().show_help {
            DownloadStep::Help
        } else {
            after_help(context)
        };
        self.set_step(step);
        Ok(())
    }

    /// Pick which micro:bit gets the program.
    pub fn choose_microbit(&self, choice: MicrobitToFlash) -> Result<(), CoreError> {
        let step = self.state.borrow().step;
        if step != DownloadStep::ChooseSameOrDifferentMicrobit || choice == MicrobitToFlash::Default {
            return Err(CoreError::invalid_step("choose a micro:bit", step));
        }
        self.state.send_modify(|s| s.microbit_to_flash = choice);

        let context = *lock(&self.context);
        let session_board = context
            .board_version
            .or_else(|| self.actions.usb().board_version());
        let next = match choice {
            MicrobitToFlash::Same if is_incompatible(session_board) => {
                info!("session micro:bit cannot run the program");
                DownloadStep::IncompatibleDevice
            }
            MicrobitToFlash::Same if context.connection_type == ConnectionType::Radio => {
                DownloadStep::UnplugRadioBridgeMicrobit
            }
            _ => DownloadStep::ConnectCable,
        };
        self.set_step(next);
        Ok(())
    }

    pub async fn on_next_click(&self) -> Result<(), CoreError> {
        let step = self.state.borrow().step;
        let context = *lock(&self.context);
        let next = match step {
            DownloadStep::Help => after_help(context),
            DownloadStep::UnplugRadioBridgeMicrobit => DownloadStep::ConnectRadioRemoteMicrobit,
            DownloadStep::ConnectCable | DownloadStep::ConnectRadioRemoteMicrobit => {
                DownloadStep::WebUsbFlashingTutorial
            }
            DownloadStep::WebUsbFlashingTutorial => return self.connect_and_flash().await,
            DownloadStep::ManualFlashingTutorial | DownloadStep::IncompatibleDevice => {
                self.close().await;
                return Ok(());
            }
            other => return Err(CoreError::invalid_step("go to the next download step", other)),
        };
        self.set_step(next);
        Ok(())
    }

    pub fn on_back_click(&self) -> Result<(), CoreError> {
        let (step, target) = {
            let s = self.state.borrow();
            (s.step, s.microbit_to_flash)
        };
        let context = *lock(&self.context);
        let connected = context.connection_status == ConnectionStatus::Connected;
        let back = match step {
            DownloadStep::ChooseSameOrDifferentMicrobit => DownloadStep::Help,
            DownloadStep::UnplugRadioBridgeMicrobit => DownloadStep::ChooseSameOrDifferentMicrobit,
            DownloadStep::ConnectRadioRemoteMicrobit => DownloadStep::UnplugRadioBridgeMicrobit,
            DownloadStep::ConnectCable if connected => DownloadStep::ChooseSameOrDifferentMicrobit,
            DownloadStep::ConnectCable => DownloadStep::Help,
            DownloadStep::WebUsbFlashingTutorial
                if target == MicrobitToFlash::Same && context.connection_type == ConnectionType::Radio =>
            {
                DownloadStep::ConnectRadioRemoteMicrobit
            }
            DownloadStep::WebUsbFlashingTutorial => DownloadStep::ConnectCable,
            other => return Err(CoreError::invalid_step("go back a download step", other)),
        };
        self.set_step(back);
        Ok(())
    }

    /// Abandon the download and release any borrowed USB handle.
    pub async fn close(&self) {
        self.release_temporary().await;
        self.state.send_modify(|s| {
            *s = DownloadState {
                show_help: s.show_help,
                ..DownloadState::default()
            };
        });
        debug!("download closed");
    }

    /// Take the single temporary USB borrow.
    pub fn borrow_temporary_usb(&self) -> Result<TemporaryUsb, CoreError> {
        let permit = Arc::clone(&self.borrow)
            .try_acquire_owned()
            .map_err(|_| CoreError::UsbBorrowed)?;
        Ok(TemporaryUsb {
            usb: self.actions.open_temporary_usb(),
            released: false,
            on_release: self.on_borrow_released.clone(),
            _permit: permit,
        })
    }

    // ── Flashing ─────────────────────────────────────────────────────

    async fn connect_and_flash(&self) -> Result<(), CoreError> {
        let (hex, target) = {
            let s = self.state.borrow();
            (s.hex.clone(), s.microbit_to_flash)
        };
        let Some(hex) = hex else {
            return Err(CoreError::invalid_step("flash without a program", DownloadStep::WebUsbFlashingTutorial));
        };

        let usb = if target == MicrobitToFlash::Different {
            let borrowed = self.borrow_temporary_usb()?;
            let usb = Arc::clone(borrowed.usb());
            *lock(&self.temporary) = Some(borrowed);
            usb
        } else {
            Arc::clone(self.actions.usb())
        };

        self.set_step(DownloadStep::WebUsbChooseMicrobit);
        let connection = self
            .actions
            .request_usb_connection(Some(&usb), self.on_same_device.as_ref())
            .await;
        self.state.send_modify(|s| s.usb_device_id = connection.device_id);

        if connection.result.is_success() {
            self.flash_on(&usb, &hex).await;
        } else {
            self.release_temporary().await;
            self.fall_back_to_manual(&hex, &connection.result.to_string()).await;
        }
        Ok(())
    }

    async fn flash_on(&self, usb: &Arc<dyn UsbTransport>, hex: &HexData) {
        if is_incompatible(usb.board_version()) {
            info!("selected micro:bit cannot run the program");
            self.release_temporary().await;
            self.set_step(DownloadStep::IncompatibleDevice);
            return;
        }

        let on_progress = |percent: u8| {
            self.state.send_modify(|s| {
                s.step = DownloadStep::FlashingInProgress;
                s.flash_progress = percent;
            });
        };
        let result = self
            .actions
            .flash_microbit(&HexSource::Program(hex.clone()), &on_progress, Some(usb))
            .await;
        self.release_temporary().await;

        if result.is_success() {
            info!(program = %hex.name, "program downloaded");
            self.state.send_modify(|s| {
                *s = DownloadState {
                    show_help: s.show_help,
                    flash_progress: 100,
                    ..DownloadState::default()
                };
            });
        } else {
            self.fall_back_to_manual(hex, &result.to_string()).await;
        }
    }

    async fn fall_back_to_manual(&self, hex: &HexData, reason: &str) {
        warn!(program = %hex.name, reason, "flashing failed, offering manual download");
        if let Err(e) = self.manual.offer(hex).await {
            warn!(error = %e, "manual download failed");
        }
        self.set_step(DownloadStep::ManualFlashingTutorial);
    }

    async fn release_temporary(&self) {
        let borrowed = lock(&self.temporary).take();
        if let Some(borrowed) = borrowed {
            borrowed.release().await;
        }
    }

    fn set_step(&self, step: DownloadStep) {
        self.state.send_modify(|s| s.step = step);
        debug!(%step, "download step");
    }
}

fn after_help(context: DownloadContext) -> DownloadStep {
    if context.connection_status == ConnectionStatus::Connected {
        DownloadStep::ChooseSameOrDifferentMicrobit
    } else {
        DownloadStep::ConnectCable
    }
}

fn is_incompatible(board: Option<BoardVersion>) -> bool {
    board.is_some_and(|b| !b.supports_ml_runtime())
}
