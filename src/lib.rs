pub mod audio;
pub mod backend;
pub mod camera;
pub mod chain;
pub mod config;
pub mod fusion;
pub mod landmark;
pub mod monitor;
pub mod risk;
