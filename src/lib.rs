//! # PACT DAQ Core Library
//!
//! Discovers instruments on the local segment over UDP multicast, drives a
//! start/stop test protocol against one of them and streams the returned
//! voltage/current telemetry into a live plot. The library holds the protocol
//! engine; the CLI (`main.rs`) and the optional desktop window (`gui`) are
//! thin front ends over [`app::PactApp`].
//!
//! ## Crate Structure
//!
//! - **`protocol`**: the `KEY=VAL;` wire codec and typed commands and frames.
//! - **`channel`**: the multicast UDP socket, the `DatagramTransport` seam and
//!   the single-receiver `SharedChannel`.
//! - **`mock`**: in-memory transport for tests and demos.
//! - **`discovery`**: `ID;` broadcast and the bounded reply window.
//! - **`controller`**: start/stop commands and the session state machine.
//! - **`telemetry`**: the background ingestion loop feeding the plot sink.
//! - **`session`**: `TestSession`, samples and CSV export.
//! - **`plot`**: the `PlotSink` trait and its implementations.
//! - **`app`**: `PactApp`, the operator-facing facade.
//! - **`simulator`**: a simulated instrument for use without hardware.
//! - **`config`**: figment-based configuration.
//! - **`tracing_init`**: tracing subscriber setup.
//! - **`error`**: `PactError` and `ValidationError`.
//! - **`gui`**: eframe/egui_plot window (feature `gui`).

pub mod app;
pub mod channel;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod error;
pub mod mock;
pub mod plot;
pub mod protocol;
pub mod session;
pub mod simulator;
pub mod telemetry;
pub mod tracing_init;

#[cfg(feature = "gui")]
pub mod gui;

pub use app::PactApp;
pub use error::{AppResult, PactError, ValidationError};
