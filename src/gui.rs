//! Desktop front end (feature `gui`).
//!
//! The window never touches the network. Button presses become [`UiCommand`]s
//! for a worker task that owns the [`PactApp`]; results come back as
//! [`WorkerEvent`]s and are drained every frame. The plot reads the shared
//! [`SeriesRecorder`] that the ingestion loop feeds.

use crate::app::PactApp;
use crate::config::PactConfig;
use crate::plot::SeriesRecorder;
use crate::session::{SessionEnd, SessionState};
use eframe::egui;
use egui_plot::{Legend, Line, Plot, PlotPoints};
use std::sync::{mpsc as std_mpsc, Arc};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

/// How often the worker reports session state while idle.
const STATUS_INTERVAL: Duration = Duration::from_millis(200);

/// Operator actions forwarded to the worker.
#[derive(Debug, Clone)]
enum UiCommand {
    Discover,
    Select(usize),
    Start(String),
    Stop,
}

/// Worker results shown by the window.
#[derive(Debug, Clone)]
enum WorkerEvent {
    Devices(Vec<String>),
    Selected(usize),
    Message(String),
    Failed(String),
    Status {
        state: SessionState,
        end: Option<SessionEnd>,
        samples: usize,
        warnings: Vec<String>,
    },
}

/// Open the window and block until it is closed.
///
/// `runtime` runs the worker; it must outlive the window.
pub fn run(config: PactConfig, runtime: tokio::runtime::Handle) -> anyhow::Result<()> {
    let title = format!("{} Test Panel", config.application.name);
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([900.0, 600.0])
            .with_min_inner_size([600.0, 400.0])
            .with_title(title.clone()),
        ..Default::default()
    };

    eframe::run_native(
        &title,
        options,
        Box::new(move |cc| Ok(Box::new(PactGui::new(cc, config, &runtime)))),
    )
    .map_err(|e| anyhow::anyhow!("GUI failed: {e}"))
}

struct PactGui {
    commands: mpsc::UnboundedSender<UiCommand>,
    events: std_mpsc::Receiver<WorkerEvent>,
    recorder: SeriesRecorder,
    devices: Vec<String>,
    selected: Option<usize>,
    duration_text: String,
    message: String,
    state: SessionState,
    end: Option<SessionEnd>,
    samples: usize,
    warnings: Vec<String>,
}

impl PactGui {
    fn new(
        cc: &eframe::CreationContext<'_>,
        config: PactConfig,
        runtime: &tokio::runtime::Handle,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = std_mpsc::channel();
        let recorder = SeriesRecorder::new();

        runtime.spawn(worker(
            config,
            recorder.clone(),
            command_rx,
            event_tx,
            cc.egui_ctx.clone(),
        ));

        Self {
            commands: command_tx,
            events: event_rx,
            recorder,
            devices: Vec::new(),
            selected: None,
            duration_text: "10".to_string(),
            message: "Press Discover to find instruments".to_string(),
            state: SessionState::Idle,
            end: None,
            samples: 0,
            warnings: Vec::new(),
        }
    }

    fn send(&mut self, command: UiCommand) {
        if self.commands.send(command).is_err() {
            self.message = "Worker stopped; restart the application".to_string();
        }
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                WorkerEvent::Devices(devices) => {
                    self.message = format!("{} device(s) found", devices.len());
                    self.devices = devices;
                    self.selected = None;
                }
                WorkerEvent::Selected(index) => self.selected = Some(index),
                WorkerEvent::Message(message) | WorkerEvent::Failed(message) => {
                    self.message = message;
                }
                WorkerEvent::Status {
                    state,
                    end,
                    samples,
                    warnings,
                } => {
                    self.state = state;
                    self.end = end;
                    self.samples = samples;
                    self.warnings = warnings;
                }
            }
        }
    }

    fn controls(&mut self, ui: &mut egui::Ui) {
        ui.heading("Devices");
        if ui.button("Discover").clicked() {
            self.message = "Discovering...".to_string();
            self.send(UiCommand::Discover);
        }

        let mut clicked = None;
        egui::ScrollArea::vertical()
            .max_height(200.0)
            .show(ui, |ui| {
                for (index, device) in self.devices.iter().enumerate() {
                    if ui
                        .selectable_label(self.selected == Some(index), device)
                        .clicked()
                    {
                        clicked = Some(index);
                    }
                }
            });
        if let Some(index) = clicked {
            self.send(UiCommand::Select(index));
        }

        ui.separator();
        ui.heading("Test");
        ui.horizontal(|ui| {
            ui.label("Duration (s)");
            ui.text_edit_singleline(&mut self.duration_text);
        });
        ui.horizontal(|ui| {
            if ui.button("Start").clicked() {
                let duration = self.duration_text.clone();
                self.send(UiCommand::Start(duration));
            }
            if ui.button("Stop").clicked() {
                self.send(UiCommand::Stop);
            }
        });

        ui.separator();
        ui.label(format!("State: {}", self.state));
        if let Some(end) = self.end {
            ui.label(format!("Last test: {end}"));
        }
        ui.label(format!("Samples: {}", self.samples));
        for warning in &self.warnings {
            ui.colored_label(egui::Color32::YELLOW, warning);
        }
        ui.separator();
        ui.label(&self.message);
    }
}

impl eframe::App for PactGui {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.drain_events();

        egui::SidePanel::left("control_panel")
            .resizable(true)
            .min_width(220.0)
            .show(ctx, |ui| self.controls(ui));

        let series = self.recorder.snapshot();
        egui::CentralPanel::default().show(ctx, |ui| {
            Plot::new("telemetry")
                .legend(Legend::default())
                .x_axis_label("time (ms)")
                .show(ui, |plot_ui| {
                    plot_ui.line(Line::new(PlotPoints::from(series.voltage_points())).name("mV"));
                    plot_ui.line(Line::new(PlotPoints::from(series.current_points())).name("mA"));
                });
        });

        if self.state == SessionState::Running {
            ctx.request_repaint_after(Duration::from_millis(100));
        }
    }
}

async fn worker(
    config: PactConfig,
    recorder: SeriesRecorder,
    mut commands: mpsc::UnboundedReceiver<UiCommand>,
    events: std_mpsc::Sender<WorkerEvent>,
    ctx: egui::Context,
) {
    let notify = |event: WorkerEvent| {
        // The window may already be gone during shutdown.
        let _ = events.send(event);
        ctx.request_repaint();
    };

    let mut app = match PactApp::from_config(&config, Arc::new(recorder)) {
        Ok(app) => app,
        Err(e) => {
            error!(error = %e, "Failed to open multicast channel");
            notify(WorkerEvent::Failed(format!("Cannot open channel: {e}")));
            return;
        }
    };
    info!("GUI worker ready");

    let mut ticker = tokio::time::interval(STATUS_INTERVAL);
    let mut last_status = None;
    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                let event = match command {
                    UiCommand::Discover => app.discover().await.map(WorkerEvent::Devices),
                    UiCommand::Select(index) => app
                        .select_device(index)
                        .map(|_| WorkerEvent::Selected(index)),
                    UiCommand::Start(duration) => app
                        .start_test(&duration)
                        .await
                        .map(|()| WorkerEvent::Message("Test started".to_string())),
                    UiCommand::Stop => app
                        .stop_test()
                        .await
                        .map(|()| WorkerEvent::Message("Test stopped".to_string())),
                };
                notify(event.unwrap_or_else(|e| WorkerEvent::Failed(e.to_string())));
            }
            _ = ticker.tick() => {
                let status = app.session().map(|s| (s.state, s.end, s.samples.len(), s.warnings));
                if status != last_status {
                    if let Some((state, end, samples, warnings)) = status.clone() {
                        notify(WorkerEvent::Status { state, end, samples, warnings });
                    }
                    last_status = status;
                }
            }
        }
    }

    app.close().await;
}
