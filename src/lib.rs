//! Library modules for the turnip finder bot.
//!
//! Re-exported so the binary and tests share one copy of the poll loop,
//! command handling and transports.

pub mod commands;
pub mod config;
pub mod discord;
pub mod filters;
pub mod finder;
pub mod island;
pub mod notify;
pub mod sources;
pub mod users;
