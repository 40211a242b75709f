//! Event notification through an external command.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use tracing::{error, info, warn};

use clip_writer::{Notifier, NullNotifier};
use vigil_config_data::NotifierConfig;

/// Runs the configured command with the message (and clip path, when
/// present) as arguments. Fire and forget: the wait happens on a
/// detached thread and failures are only logged.
pub struct CommandNotifier {
    command: String,
}

impl CommandNotifier {
    pub fn new(command: String) -> Self {
        Self { command }
    }
}

impl Notifier for CommandNotifier {
    fn notify(&self, message: &str, attachment: Option<&Path>) {
        let mut cmd = Command::new(&self.command);
        cmd.arg(message);
        if let Some(path) = attachment {
            cmd.arg(path);
        }
        match cmd.spawn() {
            Ok(mut child) => {
                std::thread::spawn(move || match child.wait() {
                    Ok(status) if status.success() => {}
                    Ok(status) => warn!("notifier command exited with {status}"),
                    Err(e) => warn!("notifier command could not be awaited: {e}"),
                });
            }
            Err(e) => error!("failed to start notifier command: {e}"),
        }
    }
}

/// Build the configured notifier, or a no-op one.
pub fn from_config(cfg: &NotifierConfig) -> Arc<dyn Notifier> {
    match (&cfg.enabled, &cfg.command) {
        (true, Some(command)) => {
            info!("notifications enabled via \"{command}\"");
            Arc::new(CommandNotifier::new(command.clone()))
        }
        (true, None) => {
            warn!("notifier enabled but no command configured; notifications disabled");
            Arc::new(NullNotifier)
        }
        (false, _) => Arc::new(NullNotifier),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_config_yields_a_noop() {
        let notifier = from_config(&NotifierConfig {
            enabled: false,
            command: Some("true".into()),
        });
        // Must not panic or spawn anything observable.
        notifier.notify("hello", None);
    }

    #[test]
    fn command_notifier_tolerates_missing_binaries() {
        let notifier = CommandNotifier::new("/definitely/not/a/binary".into());
        notifier.notify("hello", Some(Path::new("/tmp/x.mp4")));
    }
}
