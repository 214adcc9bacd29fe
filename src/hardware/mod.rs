// src/hardware/mod.rs - printer-side sensing: telemetry polling and filament runout
pub mod filament;
pub mod temperature;

pub use filament::{FilamentHandle, FilamentMonitor, FilamentSensor, FilamentState, GpioValueSensor};
pub use temperature::{PrinterSnapshot, StatusReader};
