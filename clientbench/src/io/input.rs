//! Input-injection collaborator.
//!
//! [`CommandInputDriver`] forwards each primitive to a helper program as
//! `<helper...> <action> <name>`, e.g. `key-down space` or `mouse-up left`.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::io::process::run_command_with_timeout;

/// A single press-or-release primitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum InputAction {
    KeyDown(String),
    KeyUp(String),
    MouseDown(String),
    MouseUp(String),
}

impl InputAction {
    fn verb(&self) -> &'static str {
        match self {
            InputAction::KeyDown(_) => "key-down",
            InputAction::KeyUp(_) => "key-up",
            InputAction::MouseDown(_) => "mouse-down",
            InputAction::MouseUp(_) => "mouse-up",
        }
    }

    fn name(&self) -> &str {
        match self {
            InputAction::KeyDown(name)
            | InputAction::KeyUp(name)
            | InputAction::MouseDown(name)
            | InputAction::MouseUp(name) => name,
        }
    }
}

/// Press/hold/release keys and mouse buttons.
pub trait InputDriver {
    fn send(&self, action: &InputAction) -> Result<()>;
}

/// [`InputDriver`] backed by a helper program.
#[derive(Debug, Clone)]
pub struct CommandInputDriver {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandInputDriver {
    pub fn new(command: Vec<String>, timeout: Duration) -> Result<Self> {
        if command.first().is_none_or(|program| program.trim().is_empty()) {
            bail!("input helper command must be a non-empty array");
        }
        Ok(Self { command, timeout })
    }
}

impl InputDriver for CommandInputDriver {
    fn send(&self, action: &InputAction) -> Result<()> {
        debug!(action = action.verb(), name = action.name(), "sending input");
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .arg(action.verb())
            .arg(action.name());
        let output = run_command_with_timeout(cmd, self.timeout, 4096)
            .with_context(|| format!("run input helper for {}", action.verb()))?;
        if output.timed_out || !output.status.success() {
            bail!(
                "input helper {} {} failed with status {:?}",
                action.verb(),
                action.name(),
                output.status.code()
            );
        }
        Ok(())
    }
}
