//! Core of the LED matrix display firmware
//!
//! Board crates supply the transport, the matrix driver and config
//! storage, then wire them up through [`device::Device`].

pub mod app;
pub mod assets;
pub mod config;
pub mod device;
pub mod display;
pub mod error;
pub mod framebuffer;
pub mod link;
pub mod player;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod sprite;
pub mod sync;
pub mod tracker;
pub mod transfer;
