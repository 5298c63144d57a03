//! Forwarder service: connect, authorize, subscribe, forward until disconnected.
//!
//! One instance per process. Per-message forward failures are logged and swallowed so the
//! listener keeps going; everything else ends the run. The outermost boundary in [`ForwarderService::run`]
//! turns any error or panic into a fatal log entry instead of unwinding through the caller.

use anyhow::{Context, Result};
use futures_util::FutureExt;
use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;

use crate::activity_log::ActivityLog;
use crate::client::{Connector, MessageEvent, MessagingClient};
use crate::config::{self, Config, ForwarderSettings};
use crate::session::SessionStore;

/// How a run ended. None of these are retried here; restarts belong to the process supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Connected, but the stored session is missing, expired, or belongs to another app.
    Unauthorized,
    /// Listened until the backend connection was lost.
    Disconnected,
    /// A fatal error was caught and logged.
    Failed,
}

/// Load config and resolve settings for a run, writing `Script started` first.
///
/// The started entry goes to the configured log file, or to the default one next to the
/// config file when the config itself cannot be read. Any failure here is written to that
/// same log as a fatal entry before it is returned.
pub fn prepare(config_path: Option<PathBuf>) -> Result<ForwarderSettings> {
    let path = config_path.unwrap_or_else(config::default_config_path);
    let loaded = config::load_config(Some(path.clone()));
    let log_file = match &loaded {
        Ok((config, _)) => config::resolve_log_file(config, &path),
        Err(_) => config::resolve_log_file(&Config::default(), &path),
    };
    let log = ActivityLog::new(log_file);
    log.write("Script started");

    let settings = loaded.and_then(|(config, path)| config::resolve_settings(&config, &path));
    if let Err(e) = &settings {
        log_fatal_error(&log, e);
    }
    settings
}

pub struct ForwarderService<C: Connector> {
    connector: C,
    settings: ForwarderSettings,
    log: ActivityLog,
}

impl<C: Connector> ForwarderService<C> {
    /// The activity log is written to `settings.log_file`.
    pub fn new(connector: C, settings: ForwarderSettings) -> Self {
        let log = ActivityLog::new(settings.log_file.clone());
        Self {
            connector,
            settings,
            log,
        }
    }

    /// Run to completion. Never returns an error and never panics outward.
    pub async fn run(&self) -> RunOutcome {
        match AssertUnwindSafe(self.listen()).catch_unwind().await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                log_fatal_error(&self.log, &e);
                RunOutcome::Failed
            }
            Err(panic) => {
                self.log
                    .write_fatal(&format!("Exception in main: {}", panic_message(panic.as_ref())));
                self.log.write_fatal(&format!(
                    "Stack backtrace:\n{}",
                    Backtrace::force_capture()
                ));
                RunOutcome::Failed
            }
        }
    }

    async fn listen(&self) -> Result<RunOutcome> {
        self.log.write("Trying to connect to Telegram...");
        let session = SessionStore::open(&self.settings.session_path).with_context(|| {
            format!(
                "opening session store {}",
                self.settings.session_path.display()
            )
        })?;
        let client = self
            .connector
            .connect(&self.settings.identity, session)
            .await
            .context("connecting to Telegram")?;

        if !client
            .is_authorized()
            .await
            .context("checking authorization")?
        {
            self.log.write("Session not authorized.");
            return Ok(RunOutcome::Unauthorized);
        }
        self.log.write("Connected and session authorized.");

        let mut events = client
            .subscribe(&self.settings.source)
            .await
            .with_context(|| format!("subscribing to {}", self.settings.source))?;
        self.log.write("Listening for new messages...");

        let pump = client.run_until_disconnected();
        tokio::pin!(pump);
        let result = loop {
            tokio::select! {
                res = &mut pump => break res,
                Some(event) = events.recv() => self.forward(&client, event).await,
            }
        };
        // Already acknowledged by the backend; forward before leaving.
        while let Ok(event) = events.try_recv() {
            self.forward(&client, event).await;
        }
        result.context("listening for new messages")?;

        self.log.write("Disconnected.");
        Ok(RunOutcome::Disconnected)
    }

    async fn forward(&self, client: &C::Client, event: MessageEvent) {
        log::debug!(
            "forwarding message {}: {}",
            event.id,
            event.text.as_deref().unwrap_or("<no text>")
        );
        match client.forward_message(&self.settings.target, &event).await {
            Ok(()) => self.log.write(&format!("Message forwarded: {}", event.id)),
            Err(e) => self.log.write(&format!("Error forwarding message: {}", e)),
        }
    }
}

/// Two entries: the one-line error chain, then the full chain with a stack backtrace. The
/// backtrace is the one recorded where the error was created when backtraces are enabled,
/// otherwise one captured here.
fn log_fatal_error(log: &ActivityLog, e: &anyhow::Error) {
    log.write_fatal(&format!("Exception in main: {:#}", e));
    if e.backtrace().status() == BacktraceStatus::Captured {
        log.write_fatal(&format!("{:?}", e));
    } else {
        log.write_fatal(&format!(
            "{:?}\n\nStack backtrace:\n{}",
            e,
            Backtrace::force_capture()
        ));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
