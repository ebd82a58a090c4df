//! Scripted connection scenarios over simulated transports.
//!
//! Each scenario drives a real `SessionController` against the in-memory
//! devices from `mblink_api::sim`, recording every status, flow step and
//! download step the session publishes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tabled::Tabled;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use mblink_api::sim::{
    SIM_V2_SERIAL, SimBluetooth, SimHexLibrary, SimLink, SimRadioBridge, SimUsb, SimUsbFactory,
};
use mblink_api::{DeviceConnectionStatus, HexData};
use mblink_core::{
    ConnectActions, ConnectionFlowStep, ConnectionFlowType, ConnectionStatus, DownloadPipeline,
    DownloadStep, MicrobitToFlash, SaveToDirectory, SessionConfig, SessionController,
    TransportSupport, Transports,
};

use crate::cli::{GlobalOpts, OutputFormat, Scenario, SimulateArgs};
use crate::config;
use crate::error::CliError;
use crate::output::{self, Tone};

/// A second V2 board for the download scenario (device id 99).
const OTHER_V2_SERIAL: &str = "9904360258994e4500000063";

const STEP_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CLICKS: usize = 12;

// ── Recorded transitions ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum EventKind {
    Status,
    Step,
    Download,
}

impl EventKind {
    fn label(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Step => "step",
            Self::Download => "download",
        }
    }
}

#[derive(Debug, Serialize)]
struct Transition {
    seq: usize,
    kind: EventKind,
    value: String,
}

#[derive(Debug, Serialize)]
struct Report {
    scenario: String,
    transitions: Vec<Transition>,
    final_status: ConnectionStatus,
    final_step: ConnectionFlowStep,
}

#[derive(Tabled)]
struct TransitionRow {
    #[tabled(rename = "#")]
    seq: usize,
    #[tabled(rename = "Event")]
    kind: &'static str,
    #[tabled(rename = "Value")]
    value: String,
}

fn status_tone(status: ConnectionStatus) -> Tone {
    match status {
        ConnectionStatus::Connected => Tone::Good,
        ConnectionStatus::Connecting
        | ConnectionStatus::ReconnectingAutomatically
        | ConnectionStatus::ReconnectingExplicitly => Tone::Busy,
        s if s.is_failure() || s == ConnectionStatus::FailedToSelectBluetoothDevice => Tone::Bad,
        _ => Tone::Neutral,
    }
}

// ── Simulated rig ───────────────────────────────────────────────────

struct Rig {
    usb: Arc<SimUsb>,
    bluetooth: Arc<SimBluetooth>,
    session: SessionController,
}

async fn rig(plugged: &[&str], config: SessionConfig) -> Rig {
    let usb = Arc::new(SimUsb::new(plugged.iter().copied()));
    let bluetooth = Arc::new(SimBluetooth::default());
    let bridge = Arc::new(SimRadioBridge::new(Arc::clone(&usb)));
    let transports = Transports {
        usb: usb.clone(),
        bluetooth: bluetooth.clone(),
        radio_bridge: bridge,
        usb_factory: Arc::new(
            SimUsbFactory::new(plugged.iter().copied()).claiming_from(Arc::clone(&usb)),
        ),
    };
    let actions = Arc::new(ConnectActions::new(transports, Arc::new(SimHexLibrary)));
    let session = SessionController::new(config, actions, TransportSupport::default());
    session.start().await;
    Rig {
        usb,
        bluetooth,
        session,
    }
}

// ── Recorder ────────────────────────────────────────────────────────

/// Forwards every distinct value a watch channel publishes, starting with
/// the current one.
fn watch_events<T, F>(
    mut rx: watch::Receiver<T>,
    tx: mpsc::UnboundedSender<(EventKind, String)>,
    kind: EventKind,
    describe: F,
) -> JoinHandle<()>
where
    T: Send + Sync + 'static,
    F: Fn(&T) -> String + Send + 'static,
{
    tokio::spawn(async move {
        let mut last: Option<String> = None;
        loop {
            let value = {
                let current = rx.borrow_and_update();
                describe(&*current)
            };
            if last.as_ref() != Some(&value) {
                if tx.send((kind, value.clone())).is_err() {
                    break;
                }
                last = Some(value);
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    })
}

struct Recorder {
    tx: mpsc::UnboundedSender<(EventKind, String)>,
    rx: mpsc::UnboundedReceiver<(EventKind, String)>,
    tasks: Vec<JoinHandle<()>>,
    progress: ProgressBar,
}

impl Recorder {
    fn new(session: &SessionController, show_progress: bool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let progress = if show_progress {
            let pb = ProgressBar::new(100);
            if let Ok(style) = ProgressStyle::with_template("flashing [{bar:30}] {pos:>3}%") {
                pb.set_style(style.progress_chars("=> "));
            }
            pb
        } else {
            ProgressBar::hidden()
        };

        let mut recorder = Self {
            tx,
            rx,
            tasks: Vec::new(),
            progress,
        };
        recorder.tasks.push(watch_events(
            session.subscribe_status(),
            recorder.tx.clone(),
            EventKind::Status,
            |s| s.to_string(),
        ));
        recorder.tasks.push(watch_events(
            session.subscribe_stage(),
            recorder.tx.clone(),
            EventKind::Step,
            |s| s.flow_step.to_string(),
        ));
        recorder.track_progress(session.subscribe_flash_progress());
        recorder
    }

    fn track_progress(&mut self, mut rx: watch::Receiver<u8>) {
        let pb = self.progress.clone();
        self.tasks.push(tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let percent = u64::from(*rx.borrow_and_update());
                if percent < pb.position() {
                    pb.reset();
                }
                pb.set_position(percent);
            }
        }));
    }

    fn follow_download(&mut self, pipeline: &DownloadPipeline) {
        self.tasks.push(watch_events(
            pipeline.subscribe(),
            self.tx.clone(),
            EventKind::Download,
            |s| s.step.to_string(),
        ));
        let (tx, rx) = watch::channel(0_u8);
        let mut states = pipeline.subscribe();
        self.tasks.push(tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let percent = states.borrow_and_update().flash_progress;
                if tx.send(percent).is_err() {
                    break;
                }
            }
        }));
        self.track_progress(rx);
    }

    /// Stop recording and collect what was seen, in order.
    async fn finish(mut self) -> Vec<Transition> {
        // Let the forwarders drain what the session already published.
        tokio::time::sleep(Duration::from_millis(20)).await;
        for task in &self.tasks {
            task.abort();
        }
        self.progress.finish_and_clear();
        drop(self.tx);

        let mut transitions = Vec::new();
        while let Some((kind, value)) = self.rx.recv().await {
            transitions.push(Transition {
                seq: transitions.len() + 1,
                kind,
                value,
            });
        }
        transitions
    }
}

// ── Driving helpers ─────────────────────────────────────────────────

async fn within<T>(scenario: Scenario, what: &str, fut: impl Future<Output = T>) -> Result<T, CliError> {
    tokio::time::timeout(STEP_TIMEOUT, fut)
        .await
        .map_err(|_| failed(scenario, format!("timed out waiting for {what}")))
}

fn failed(scenario: Scenario, reason: impl Into<String>) -> CliError {
    CliError::Scenario {
        scenario: scenario_name(scenario),
        reason: reason.into(),
    }
}

fn scenario_name(scenario: Scenario) -> String {
    scenario
        .to_possible_value()
        .map_or_else(|| format!("{scenario:?}"), |v| v.get_name().to_owned())
}

async fn wait_for_status(
    session: &SessionController,
    scenario: Scenario,
    want: ConnectionStatus,
) -> Result<(), CliError> {
    let mut rx = session.subscribe_status();
    within(scenario, &want.to_string(), rx.wait_for(|s| *s == want))
        .await?
        .map_err(|_| failed(scenario, "session stopped"))?;
    Ok(())
}

/// Click "Next" until the dialog reaches `want`.
async fn click_until(
    session: &SessionController,
    scenario: Scenario,
    want: ConnectionFlowStep,
) -> Result<(), CliError> {
    for _ in 0..MAX_CLICKS {
        if session.stage().flow_step == want {
            return Ok(());
        }
        session.on_next_click().await?;
    }
    Err(failed(
        scenario,
        format!("stuck at {} instead of {want}", session.stage().flow_step),
    ))
}

async fn connect(session: &SessionController, scenario: Scenario, flow: ConnectionFlowType) -> Result<(), CliError> {
    session.start_connect_flow(flow).await?;
    click_until(session, scenario, ConnectionFlowStep::None).await?;
    wait_for_status(session, scenario, ConnectionStatus::Connected).await
}

// ── Scenarios ───────────────────────────────────────────────────────

async fn run_scenario(
    scenario: Scenario,
    rig: &Rig,
    recorder: &mut Recorder,
    manual: Arc<SaveToDirectory>,
) -> Result<(), CliError> {
    let session = &rig.session;
    match scenario {
        Scenario::Bluetooth => connect(session, scenario, ConnectionFlowType::ConnectBluetooth).await,

        Scenario::Radio => connect(session, scenario, ConnectionFlowType::ConnectRadioRemote).await,

        Scenario::RadioBridgeLost => {
            connect(session, scenario, ConnectionFlowType::ConnectRadioRemote).await?;
            rig.usb.unplug();
            wait_for_status(session, scenario, ConnectionStatus::ConnectionLost).await?;
            rig.usb.set_status(DeviceConnectionStatus::Disconnected);
            wait_for_status(session, scenario, ConnectionStatus::FailedToReconnectTwice).await
        }

        Scenario::BluetoothReconnectFail => {
            connect(session, scenario, ConnectionFlowType::ConnectBluetooth).await?;
            rig.bluetooth.set_status(DeviceConnectionStatus::Reconnecting);
            wait_for_status(session, scenario, ConnectionStatus::ReconnectingAutomatically).await?;
            rig.bluetooth.set_status(DeviceConnectionStatus::Disconnected);
            wait_for_status(session, scenario, ConnectionStatus::ConnectionLost).await?;

            rig.bluetooth.script(SimLink::Drop);
            let result = session.reconnect().await?;
            tracing::info!(%result, "explicit reconnect finished");
            wait_for_status(session, scenario, ConnectionStatus::FailedToReconnectTwice).await
        }

        Scenario::DownloadDifferent => {
            connect(session, scenario, ConnectionFlowType::ConnectRadioRemote).await?;
            let pipeline = session.download_pipeline(manual);
            recorder.follow_download(&pipeline);

            let program = HexData {
                name: "simulated-program".into(),
                hex: ":020000040000FA\n:00000001FF\n".into(),
            };
            pipeline.start(program, session.download_context().await).await?;
            if pipeline.state().step == DownloadStep::Help {
                pipeline.on_next_click().await?;
            }
            pipeline.choose_microbit(MicrobitToFlash::Different)?;
            for _ in 0..MAX_CLICKS {
                if pipeline.state().step == DownloadStep::None {
                    return Ok(());
                }
                if pipeline.state().step == DownloadStep::ManualFlashingTutorial {
                    return Err(failed(scenario, "flashing fell back to a manual download"));
                }
                pipeline.on_next_click().await?;
            }
            Err(failed(scenario, format!("download stuck at {}", pipeline.state().step)))
        }
    }
}

// ── Handler ─────────────────────────────────────────────────────────

pub async fn handle(args: SimulateArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let (cfg, session_config) = config::session_config(global)?;
    let download_dir = args.download_dir.unwrap_or_else(|| cfg.download_dir());
    let plugged: &[&str] = match args.scenario {
        Scenario::DownloadDifferent => &[SIM_V2_SERIAL, OTHER_V2_SERIAL],
        _ => &[SIM_V2_SERIAL],
    };

    let rig = rig(plugged, session_config).await;
    let show_progress = !global.quiet && global.output == OutputFormat::Table;
    let mut recorder = Recorder::new(&rig.session, show_progress);

    tracing::debug!(scenario = ?args.scenario, "running simulation");
    let outcome = run_scenario(
        args.scenario,
        &rig,
        &mut recorder,
        Arc::new(SaveToDirectory::new(download_dir)),
    )
    .await;

    let transitions = recorder.finish().await;
    let report = Report {
        scenario: scenario_name(args.scenario),
        transitions,
        final_status: rig.session.status(),
        final_step: rig.session.stage().flow_step,
    };
    rig.session.shutdown().await;

    let color = output::should_color(global.color);
    let out = output::render_single(
        global.output,
        &report,
        |r| render_table(r, color),
        |r| {
            r.transitions
                .iter()
                .map(|t| format!("{} {}", t.kind.label(), t.value))
                .collect::<Vec<_>>()
                .join("\n")
        },
    )?;
    output::print_output(&out, global.quiet);
    outcome
}

fn render_table(report: &Report, color: bool) -> String {
    let rows: Vec<TransitionRow> = report
        .transitions
        .iter()
        .map(|t| {
            let tone = match t.kind {
                EventKind::Status => t
                    .value
                    .parse()
                    .map_or(Tone::Neutral, status_tone),
                EventKind::Step | EventKind::Download => Tone::Neutral,
            };
            TransitionRow {
                seq: t.seq,
                kind: t.kind.label(),
                value: output::paint(&t.value, tone, color),
            }
        })
        .collect();
    let table = tabled::Table::new(rows)
        .with(tabled::settings::Style::rounded())
        .to_string();
    format!(
        "{table}\nFinal status: {}",
        output::paint(
            &report.final_status.to_string(),
            status_tone(report.final_status),
            color
        )
    )
}
