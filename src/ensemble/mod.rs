// src/ensemble/mod.rs

pub mod agent;
pub mod cancellation;
pub mod client_wrapper;
pub mod concurrent;
pub mod config;
pub mod error;
pub mod event;
pub mod group_chat;
pub mod handoff;
pub mod magentic;
pub mod message;
pub mod orchestration;
pub mod result;
pub mod runtime;
pub mod sequential;

use std::sync::Once;

static INIT_LOGGER: Once = Once::new();

/// Initialise the global [`env_logger`] subscriber exactly once.
///
/// Applications embedding ensemble can opt in to `RUST_LOG` driven
/// diagnostics (run start/finish, per-turn dispatch, discarded replies)
/// without choosing a logging backend upfront.
///
/// ```rust
/// ensemble::init_logger();
/// log::info!("Logger is ready");
/// ```
pub fn init_logger() {
    INIT_LOGGER.call_once(|| {
        env_logger::init();
    });
}
