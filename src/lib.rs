pub mod blackbox;
pub mod cli;
pub mod dynamic;
pub mod events;
pub mod fan;
pub mod game;
pub mod platform;
pub mod power;
pub mod safety;
pub mod session;
pub mod settings;
pub mod stream;
pub mod telemetry;
pub mod tuning;
pub mod watchdog;
