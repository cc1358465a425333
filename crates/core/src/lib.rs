#![deny(warnings)]

pub mod audio;
pub mod capture;
pub mod config;
pub mod detector;
pub mod emotion;
pub mod scheduler;
pub mod session;
pub mod telemetry;
pub mod video;
