//! Croma host: streams G-code to a printer over its serial link and serves the
//! printer's status and controls over HTTP.

pub mod communication;
pub mod config;
pub mod file_manager;
pub mod hardware;
pub mod print_job;
pub mod printer;
pub mod store;
pub mod web;

pub use printer::{ControllerError, PrinterController};
