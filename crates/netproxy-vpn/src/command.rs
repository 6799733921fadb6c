//! Command Surface
//!
//! Commands arrive from the UI layer as JSON objects tagged by `method`:
//!
//! ```text
//! {"method": "isRunning"}                                   -> bool
//! {"method": "startVpn", "proxyHost": "127.0.0.1",
//!  "proxyPort": 9099, "allowApps": [...], ...}              -> bool (consent granted)
//! {"method": "stopVpn"}                                     -> null
//! {"method": "restartVpn", ...}                             -> null
//! ```
//!
//! Arguments are validated here, before the session controller sees them.
//! Start and restart run on tokio's blocking pool since the platform may
//! hold them on a consent prompt.

use crate::config::{CommandArgs, ConfigError};
use crate::session::{SessionController, SessionError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

const METHODS: &[&str] = &["isRunning", "startVpn", "stopVpn", "restartVpn"];

/// A validated-shape command from the UI layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum Command {
    IsRunning,
    StartVpn(CommandArgs),
    StopVpn,
    RestartVpn(CommandArgs),
}

impl Command {
    /// Parse one JSON command
    pub fn parse(input: &str) -> Result<Self, CommandError> {
        let value: Value =
            serde_json::from_str(input).map_err(|e| CommandError::Malformed(e.to_string()))?;

        let method = value
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| CommandError::Malformed("missing \"method\"".to_string()))?;
        if !METHODS.contains(&method) {
            return Err(CommandError::NotImplemented(method.to_string()));
        }

        serde_json::from_value(value).map_err(|e| CommandError::Malformed(e.to_string()))
    }

    pub fn method(&self) -> &'static str {
        match self {
            Command::IsRunning => "isRunning",
            Command::StartVpn(_) => "startVpn",
            Command::StopVpn => "stopVpn",
            Command::RestartVpn(_) => "restartVpn",
        }
    }
}

/// Result of a handled command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutput {
    Running(bool),
    /// `false` when the platform consent flow was started instead
    Started { consent_granted: bool },
    Stopped,
    Restarted,
}

impl CommandOutput {
    /// Result payload as sent back to the UI layer
    pub fn to_value(&self) -> Value {
        match self {
            CommandOutput::Running(running) => Value::Bool(*running),
            CommandOutput::Started { consent_granted } => Value::Bool(*consent_granted),
            CommandOutput::Stopped | CommandOutput::Restarted => Value::Null,
        }
    }
}

/// Command errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("Malformed command: {0}")]
    Malformed(String),

    #[error("Method not implemented: {0}")]
    NotImplemented(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(#[from] ConfigError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Command worker failed: {0}")]
    Worker(String),
}

impl CommandError {
    /// Stable error kind for the UI layer
    pub fn kind(&self) -> &'static str {
        match self {
            CommandError::Malformed(_) | CommandError::InvalidArguments(_) => "invalidCommand",
            CommandError::NotImplemented(_) => "notImplemented",
            CommandError::Session(
                SessionError::AlreadyActive(_) | SessionError::TunnelStillHeld,
            ) => "alreadyActive",
            CommandError::Session(SessionError::Config(_)) => "invalidCommand",
            CommandError::Session(SessionError::Establish(_)) => "establishFailure",
            CommandError::Session(SessionError::Processor(_)) | CommandError::Worker(_) => {
                "internal"
            }
        }
    }
}

/// Dispatches commands to the session controller
#[derive(Clone)]
pub struct VpnService {
    controller: Arc<SessionController>,
}

impl VpnService {
    pub fn new(controller: Arc<SessionController>) -> Self {
        Self { controller }
    }

    pub fn controller(&self) -> &Arc<SessionController> {
        &self.controller
    }

    pub async fn handle(&self, command: Command) -> Result<CommandOutput, CommandError> {
        debug!("Handling {}", command.method());

        match command {
            Command::IsRunning => Ok(CommandOutput::Running(self.controller.is_running())),

            Command::StartVpn(args) => {
                let config = args.into_config(None)?;
                let controller = self.controller.clone();

                self.blocking(move || {
                    let platform = controller.platform().clone();
                    if !platform.is_prepared() {
                        info!("VPN consent required, deferring start");
                        controller.remember(config);
                        platform.request_consent();
                        return Ok(CommandOutput::Started {
                            consent_granted: false,
                        });
                    }

                    controller.start(config)?;
                    Ok(CommandOutput::Started {
                        consent_granted: true,
                    })
                })
                .await
            }

            Command::StopVpn => {
                let controller = self.controller.clone();
                self.blocking(move || {
                    controller.stop();
                    Ok(CommandOutput::Stopped)
                })
                .await
            }

            Command::RestartVpn(mut args) => {
                let controller = self.controller.clone();

                // The last config sits behind the transition lock, which a
                // slow start holds; resolve it off the runtime threads.
                self.blocking(move || {
                    let previous = controller.last_config();
                    if previous.is_none() {
                        controller.settings().apply_defaults(&mut args);
                    }
                    let config = args.into_config(previous.as_deref())?;
                    controller.restart(config)?;
                    Ok(CommandOutput::Restarted)
                })
                .await
            }
        }
    }

    /// Parse and handle one JSON command, producing the JSON reply
    pub async fn handle_json(&self, input: &str) -> Value {
        let result = match Command::parse(input) {
            Ok(command) => self.handle(command).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(output) => json!({ "result": output.to_value() }),
            Err(e) => {
                warn!("Command failed: {}", e);
                json!({ "error": { "kind": e.kind(), "message": e.to_string() } })
            }
        }
    }

    async fn blocking<F>(&self, f: F) -> Result<CommandOutput, CommandError>
    where
        F: FnOnce() -> Result<CommandOutput, CommandError> + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| CommandError::Worker(e.to_string()))?
    }
}
