use std::future::Future;
use std::process::Stdio;
use anyhow::{bail, Context, Result};
use tokio::process::Command;
use shared::ChangeEvent;
use crate::config::NotifyConfig;

pub trait Notifier {
    fn notify(&self, subject: &str, message: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Writes notifications to the log only
pub struct LogNotifier;

impl Notifier for LogNotifier {
    async fn notify(&self, subject: &str, message: &str) -> Result<()> {
        tracing::warn!("{}: {}", subject, message);
        Ok(())
    }
}

/// Runs a configured command with subject and message as trailing arguments
pub struct CommandNotifier {
    argv: Vec<String>,
}

impl CommandNotifier {
    pub fn new(argv: Vec<String>) -> Result<Self> {
        if argv.is_empty() {
            bail!("notify.command must name a program");
        }
        Ok(Self { argv })
    }
}

impl Notifier for CommandNotifier {
    async fn notify(&self, subject: &str, message: &str) -> Result<()> {
        tracing::info!("{}: {}", subject, message);
        let status = Command::new(&self.argv[0])
            .args(&self.argv[1..])
            .arg(subject)
            .arg(message)
            .stdin(Stdio::null())
            .status()
            .await
            .with_context(|| format!("Failed to run notifier {}", self.argv[0]))?;

        if !status.success() {
            bail!("notifier {} exited with {}", self.argv[0], status);
        }
        Ok(())
    }
}

/// The notifier chosen by config
pub enum ConfiguredNotifier {
    Log(LogNotifier),
    Command(CommandNotifier),
}

impl ConfiguredNotifier {
    pub fn from_config(config: &NotifyConfig) -> Result<Self> {
        match &config.command {
            Some(argv) => Ok(ConfiguredNotifier::Command(CommandNotifier::new(argv.clone())?)),
            None => Ok(ConfiguredNotifier::Log(LogNotifier)),
        }
    }
}

impl Notifier for ConfiguredNotifier {
    async fn notify(&self, subject: &str, message: &str) -> Result<()> {
        match self {
            ConfiguredNotifier::Log(n) => n.notify(subject, message).await,
            ConfiguredNotifier::Command(n) => n.notify(subject, message).await,
        }
    }
}

/// Send one notification per event. Failures are logged, never propagated.
pub async fn dispatch<N: Notifier>(notifier: &N, events: &[ChangeEvent]) -> usize {
    let mut sent = 0;
    for event in events {
        match notifier.notify(event.subject(), &event.message()).await {
            Ok(()) => sent += 1,
            Err(e) => tracing::warn!("Notification for {} failed: {:#}", event.mac(), e),
        }
    }
    sent
}
