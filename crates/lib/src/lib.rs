//! tgforward core library: listens on one Telegram chat and forwards each new message
//! to another, keeping an append-only activity log.

pub mod activity_log;
pub mod client;
pub mod config;
pub mod init;
pub mod service;
pub mod session;
