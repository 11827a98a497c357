//! Pluggable in-game interaction performed during the measured window.

use anyhow::{Context, Result, bail};

use crate::io::input::{InputAction, InputDriver};

/// Something done to the client through simulated input.
///
/// Closures taking the input driver implement this directly.
pub trait Interaction {
    fn perform(&self, input: &dyn InputDriver) -> Result<()>;
}

impl<F> Interaction for F
where
    F: Fn(&dyn InputDriver) -> Result<()>,
{
    fn perform(&self, input: &dyn InputDriver) -> Result<()> {
        self(input)
    }
}

/// Press and hold keys, then mouse buttons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoldInputs {
    pub keys: Vec<String>,
    pub buttons: Vec<String>,
}

/// Release what [`HoldInputs`] pressed, keys first.
///
/// Every release is attempted even if an earlier one fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseInputs {
    pub keys: Vec<String>,
    pub buttons: Vec<String>,
}

impl HoldInputs {
    /// Jump, walk forward and hold the primary button.
    pub fn default_benchmark() -> Self {
        Self {
            keys: vec!["space".to_string(), "w".to_string()],
            buttons: vec!["left".to_string()],
        }
    }

    /// The matching release interaction.
    pub fn release(&self) -> ReleaseInputs {
        ReleaseInputs {
            keys: self.keys.clone(),
            buttons: self.buttons.clone(),
        }
    }
}

impl Interaction for HoldInputs {
    fn perform(&self, input: &dyn InputDriver) -> Result<()> {
        let actions = self
            .keys
            .iter()
            .map(|key| InputAction::KeyDown(key.clone()))
            .chain(
                self.buttons
                    .iter()
                    .map(|button| InputAction::MouseDown(button.clone())),
            );
        send_all(input, actions)
    }
}

impl Interaction for ReleaseInputs {
    fn perform(&self, input: &dyn InputDriver) -> Result<()> {
        let actions = self
            .keys
            .iter()
            .map(|key| InputAction::KeyUp(key.clone()))
            .chain(
                self.buttons
                    .iter()
                    .map(|button| InputAction::MouseUp(button.clone())),
            );
        send_each(input, actions)
    }
}

fn send_all(input: &dyn InputDriver, actions: impl Iterator<Item = InputAction>) -> Result<()> {
    for action in actions {
        input
            .send(&action)
            .with_context(|| format!("send {action:?}"))?;
    }
    Ok(())
}

fn send_each(input: &dyn InputDriver, actions: impl Iterator<Item = InputAction>) -> Result<()> {
    let mut attempted = 0usize;
    let mut failures = Vec::new();
    for action in actions {
        attempted += 1;
        if let Err(err) = input.send(&action) {
            failures.push(format!("{action:?}: {err:#}"));
        }
    }
    if !failures.is_empty() {
        bail!(
            "failed to send {} of {attempted} input(s): {}",
            failures.len(),
            failures.join("; ")
        );
    }
    Ok(())
}
