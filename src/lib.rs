#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod config;
pub mod data;
pub mod discover;
pub mod exception;
pub mod newsblur;
pub mod session;
pub mod storage;

#[cfg(test)]
mod testing;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::run;
