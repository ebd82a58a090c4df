// ── Connection flow sequencing ──
//
// Pure step transitions for the connection dialog. The session controller
// owns the `ConnectionStage` and runs the async work a transition asks
// for; nothing here touches a transport.

use crate::error::CoreError;
use crate::model::{ConnectResult, ConnectionFlowStep, ConnectionStage, ConnectionStatus};

use crate::model::ConnectionFlowStep as Step;
use crate::model::ConnectionFlowType as Flow;

/// Async work bound to the step a transition lands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepWork {
    /// Select a micro:bit over USB and flash the firmware for the flow.
    FlashMicrobit,
    /// Connect over Bluetooth using the stage's name filter.
    ConnectBluetooth,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowTransition {
    pub stage: ConnectionStage,
    pub work: Option<StepWork>,
}

impl FlowTransition {
    fn to(stage: ConnectionStage) -> Self {
        Self { stage, work: None }
    }
}

/// What "try again" leads to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TryAgain {
    Step(ConnectionStage),
    /// Reconnect the existing session.
    Reconnect,
    /// Begin the flow again from `Start`.
    Restart(ConnectionStage),
}

/// Advance on "Next".
pub fn next(stage: &ConnectionStage) -> Result<FlowTransition, CoreError> {
    let flow = stage.flow_type;
    let step = match (stage.flow_step, flow) {
        (Step::Start, _) => Step::ConnectCable,
        (Step::ConnectCable, Flow::ConnectBluetooth) if !stage.is_web_usb_supported => {
            Step::ManualFlashingTutorial
        }
        (Step::ConnectCable, _) => Step::WebUsbFlashingTutorial,
        (Step::WebUsbFlashingTutorial, _) => {
            return Ok(FlowTransition {
                stage: stage.with_step(Step::WebUsbChooseMicrobit),
                work: Some(StepWork::FlashMicrobit),
            });
        }
        (Step::ManualFlashingTutorial, Flow::ConnectBluetooth | Flow::ConnectRadioRemote) => {
            Step::ConnectBattery
        }
        (Step::ConnectBattery, Flow::ConnectBluetooth) => Step::EnterBluetoothPattern,
        (Step::ConnectBattery, Flow::ConnectRadioRemote) => {
            let mut bridge = stage.with_step(Step::ConnectCable);
            bridge.flow_type = Flow::ConnectRadioBridge;
            return Ok(FlowTransition::to(bridge));
        }
        (Step::EnterBluetoothPattern, _) => {
            if stage.bluetooth_microbit_name.is_none() {
                return Err(CoreError::MissingDevice {
                    what: "micro:bit name for the Bluetooth pattern",
                });
            }
            Step::ConnectBluetoothTutorial
        }
        (Step::ConnectBluetoothTutorial, _) => {
            return Ok(FlowTransition {
                stage: stage.with_step(Step::ConnectingBluetooth),
                work: Some(StepWork::ConnectBluetooth),
            });
        }
        (other, _) => return Err(CoreError::invalid_step("go to the next step", other)),
    };
    Ok(FlowTransition::to(stage.with_step(step)))
}

/// Go back on "Back".
pub fn back(stage: &ConnectionStage) -> Result<ConnectionStage, CoreError> {
    let flashing_tutorial = if stage.is_web_usb_supported {
        Step::WebUsbFlashingTutorial
    } else {
        Step::ManualFlashingTutorial
    };
    let step = match (stage.flow_step, stage.flow_type) {
        (Step::ConnectCable, Flow::ConnectRadioBridge) => {
            let mut remote = stage.with_step(Step::ConnectBattery);
            remote.flow_type = Flow::ConnectRadioRemote;
            return Ok(remote);
        }
        (Step::ConnectCable, _) => Step::Start,
        (Step::WebUsbFlashingTutorial | Step::ManualFlashingTutorial, _) => Step::ConnectCable,
        (Step::ConnectBattery, Flow::ConnectBluetooth) => flashing_tutorial,
        (Step::ConnectBattery, _) => Step::WebUsbFlashingTutorial,
        (Step::EnterBluetoothPattern, _) => Step::ConnectBattery,
        (Step::ConnectBluetoothTutorial, _) => Step::EnterBluetoothPattern,
        (other, _) => return Err(CoreError::invalid_step("go back", other)),
    };
    Ok(stage.with_step(step))
}

/// Swap between the Bluetooth and radio flows.
///
/// Offered at `Start`, at the first device's cable step, and when the
/// device cannot run the chosen flow's firmware. Any device picked so far
/// is forgotten.
pub fn switch_flow_type(stage: &ConnectionStage) -> Result<ConnectionStage, CoreError> {
    let step = match (stage.flow_step, stage.flow_type) {
        (Step::Start, _) | (Step::ConnectCable, Flow::ConnectBluetooth | Flow::ConnectRadioRemote) => {
            stage.flow_step
        }
        (Step::MicrobitUnsupported, _) => Step::Start,
        (other, _) => return Err(CoreError::invalid_step("switch connection type", other)),
    };
    let flow_type = match stage.flow_type {
        Flow::ConnectBluetooth => Flow::ConnectRadioRemote,
        Flow::ConnectRadioRemote | Flow::ConnectRadioBridge => Flow::ConnectBluetooth,
    };
    let supported = match flow_type {
        Flow::ConnectBluetooth => stage.is_web_bluetooth_supported,
        Flow::ConnectRadioRemote | Flow::ConnectRadioBridge => stage.is_web_usb_supported,
    };
    if !supported {
        return Err(CoreError::Unsupported {
            operation: format!("switching to {flow_type}"),
        });
    }

    let mut switched = stage.with_step(step);
    switched.flow_type = flow_type;
    switched.clear_devices();
    Ok(switched)
}

/// Handle "Try again" on a failure step.
pub fn try_again(stage: &ConnectionStage) -> Result<TryAgain, CoreError> {
    match stage.flow_step {
        Step::TryAgainReplugMicrobit
        | Step::TryAgainCloseTabs
        | Step::TryAgainSelectMicrobit
        | Step::BadFirmware => Ok(TryAgain::Step(stage.with_step(Step::ConnectCable))),
        Step::TryAgainBluetoothSelectMicrobit => {
            Ok(TryAgain::Step(stage.with_step(Step::ConnectBluetoothTutorial)))
        }
        Step::ReconnectFailed | Step::ConnectionLost => Ok(TryAgain::Reconnect),
        Step::ConnectFailed | Step::ReconnectFailedTwice => {
            Ok(TryAgain::Restart(ConnectionStage::new(stage.flow_type, stage.support())))
        }
        other => Err(CoreError::invalid_step("try again", other)),
    }
}

/// Where a USB select-and-flash attempt leads.
pub fn after_flash(stage: &ConnectionStage, result: ConnectResult) -> ConnectionStage {
    let step = match result {
        ConnectResult::Success => match stage.flow_type {
            Flow::ConnectBluetooth | Flow::ConnectRadioRemote => Step::ConnectBattery,
            Flow::ConnectRadioBridge => Step::ConnectingMicrobits,
        },
        ConnectResult::ErrorMicrobitUnsupported => Step::MicrobitUnsupported,
        ConnectResult::ErrorBadFirmware => Step::BadFirmware,
        ConnectResult::ErrorNoDeviceSelected => Step::TryAgainSelectMicrobit,
        ConnectResult::ErrorUnableToClaimInterface => Step::TryAgainCloseTabs,
        ConnectResult::Failed => Step::TryAgainReplugMicrobit,
    };
    stage.with_step(step)
}

/// Where a Bluetooth or radio link attempt leads.
pub fn after_link(stage: &ConnectionStage, result: ConnectResult) -> ConnectionStage {
    let step = match result {
        ConnectResult::Success => Step::None,
        ConnectResult::ErrorNoDeviceSelected if stage.flow_type == Flow::ConnectBluetooth => {
            Step::TryAgainBluetoothSelectMicrobit
        }
        _ => Step::ConnectFailed,
    };
    stage.with_step(step)
}

/// The step a reducer status routes to, if it routes anywhere.
pub fn step_for_status(status: ConnectionStatus) -> Option<ConnectionFlowStep> {
    match status {
        ConnectionStatus::Connected => Some(Step::None),
        ConnectionStatus::FailedToConnect => Some(Step::ConnectFailed),
        ConnectionStatus::FailedToReconnect => Some(Step::ReconnectFailed),
        ConnectionStatus::FailedToReconnectTwice => Some(Step::ReconnectFailedTwice),
        ConnectionStatus::ConnectionLost => Some(Step::ConnectionLost),
        ConnectionStatus::FailedToSelectBluetoothDevice => Some(Step::TryAgainBluetoothSelectMicrobit),
        ConnectionStatus::NotConnected
        | ConnectionStatus::Connecting
        | ConnectionStatus::Disconnected
        | ConnectionStatus::ReconnectingAutomatically
        | ConnectionStatus::ReconnectingExplicitly => None,
    }
}
