//! # scan_daq
//!
//! Scan orchestration and data collation for laboratory data acquisition.
//!
//! An [`experiment::Experiment`] runs as a state machine inside a mailbox
//! actor. It turns a user-selected scan method into a sequence of steps,
//! dispatches each step's reads and writes concurrently against a registry
//! of instrument axes, records every value with its step and point, and
//! finally collates the recorded streams into a dense dataset that is
//! persisted alongside the raw data.
//!
//! ## Crate Structure
//!
//! - **`actor`**: mailbox, address and the `Actor` lifecycle.
//! - **`fsm`**: table-driven state machine behaviors with transition hooks.
//! - **`axis`**: the `Axis` contract and its proxied, manual, simulated and
//!   logical variants.
//! - **`instrument`**: instruments, properties and path-based lookup.
//! - **`scan`**: degrees of freedom, composition, strategies and scan methods.
//! - **`collation`**: joining recorded streams into a dense dataset.
//! - **`experiment`**: the orchestrator, runs, interlocks and persistence.
//! - **`session`**: application state at rest.
//! - **`app`**: the runtime that runs actors concurrently.
//! - **`mock`**: simulated instruments.
//! - **`config`**, **`logging`**, **`error`**, **`value`**: ambient support.

pub mod actor;
pub mod app;
pub mod axis;
pub mod collation;
pub mod config;
pub mod error;
pub mod experiment;
pub mod fsm;
pub mod instrument;
pub mod logging;
pub mod mock;
pub mod scan;
pub mod session;
pub mod value;

pub use error::{AppResult, DaqError};
