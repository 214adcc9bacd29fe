// croma_simulator: virtual printer for tests and `croma-host --simulate`

pub mod simulator;

pub use simulator::{OpenFailure, VirtualPrinter, DEFAULT_PORT};
