pub mod shared;
pub mod clock;
pub mod traits;
pub mod waveform;
pub mod edge;
pub mod config;
pub mod calibration;
pub mod lock;
pub mod diagnostics;
pub mod phase;
pub mod controller;
pub mod status;
pub mod sim;
