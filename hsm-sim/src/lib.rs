//! # HSM Simulator
//!
//! Purpose: Answer framed HSM commands over TCP so the client can be
//! exercised end to end without hardware.
//!
//! Only the handful of commands the client itself issues are understood;
//! everything else gets the "command not supported" error code.

mod server;

pub use server::{dispatch_command, handle_connection, serve};
