//! Capabilities the session needs from its surroundings.
//!
//! The simulation (an emulated machine) is reached through [`SimulationDriver`], the UI
//! through [`HostUi`]. Neither is owned by this crate; the session calls into them from its
//! run loop and from the rollback callbacks.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::rollback::save_pool::SaveBuffer;
use crate::NetplayError;

/// Analog bind values at or above this count as pressed.
pub const PRESS_THRESHOLD: f32 = 0.25;

/// How the simulation is booted when a joiner has none running.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootParams {
    /// Content to boot. `None` boots an empty machine; the host's snapshot replaces it anyway.
    pub content: Option<PathBuf>,
    /// Skip any boot animation.
    pub fast_boot: bool,
}

/// The deterministic simulation kept in lock-step.
///
/// `I` is the per-frame input exchanged between peers.
pub trait SimulationDriver<I> {
    /// Whether a simulation is loaded.
    fn is_running(&self) -> bool;

    /// Boots a simulation.
    ///
    /// # Errors
    /// Returns [`NetplayError::Simulation`] if the machine cannot start.
    fn boot(&mut self, params: &BootParams) -> Result<(), NetplayError>;

    /// Runs exactly one frame with the inputs last given to [`set_inputs`](Self::set_inputs).
    ///
    /// # Errors
    /// Returns [`NetplayError::Simulation`] if the machine fails.
    fn run_frame(&mut self) -> Result<(), NetplayError>;

    /// Shows the last completed frame. Not called during resimulation.
    fn present_frame(&mut self) {}

    /// Format version of [`save_state`](Self::save_state). Peers refuse snapshots of another
    /// version.
    fn state_version(&self) -> u32;

    /// Serializes the full machine state for a reset snapshot.
    ///
    /// # Errors
    /// Returns [`NetplayError::Snapshot`] if the state cannot be captured.
    fn save_state(&mut self) -> Result<Vec<u8>, NetplayError>;

    /// Replaces the machine state with one produced by [`save_state`](Self::save_state).
    ///
    /// # Errors
    /// Returns [`NetplayError::Snapshot`] if the state is rejected.
    fn load_state(&mut self, raw: &[u8]) -> Result<(), NetplayError>;

    /// Captures the in-memory state for a rollback save, reusing the buffer's allocation.
    ///
    /// # Errors
    /// Returns [`NetplayError::Snapshot`] if the state cannot be captured.
    fn save_memory_state(&mut self, buffer: &mut SaveBuffer) -> Result<(), NetplayError>;

    /// Restores a state captured by [`save_memory_state`](Self::save_memory_state).
    ///
    /// # Errors
    /// Returns [`NetplayError::Snapshot`] if the buffer is rejected.
    fn load_memory_state(&mut self, buffer: &SaveBuffer) -> Result<(), NetplayError>;

    /// The machine's own frame counter.
    fn frame_number(&self) -> u32;

    /// Mutes or unmutes audio output. Muted while rolling back.
    fn set_audio_muted(&mut self, muted: bool);

    /// Inputs of every player for the next [`run_frame`](Self::run_frame), in player order.
    fn set_inputs(&mut self, inputs: &[I]);

    /// Samples the local player's input.
    fn read_local_input(&mut self) -> I;

    /// Layers netplay settings over the user's, or restores the user's with `None`.
    fn apply_settings(&mut self, overlay: Option<&SettingsOverlay>);

    /// Stops the simulation.
    fn shutdown(&mut self);
}

/// Progress of a blocking phase, for a loading screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadingProgress {
    /// What is going on.
    pub message: &'static str,
    /// Steps done.
    pub value: u32,
    /// Steps in total, or `0` when unknown.
    pub max: u32,
}

impl LoadingProgress {
    /// Progress without a known end.
    #[must_use]
    pub const fn indeterminate(message: &'static str) -> Self {
        Self {
            message,
            value: 0,
            max: 0,
        }
    }
}

/// What the session needs from the user interface.
pub trait HostUi {
    /// A short informational message (joins, leaves, chat, desync notices).
    fn on_message(&mut self, message: &str);

    /// An error the user has to see.
    fn report_error(&mut self, title: &str, message: &str);

    /// Updates the loading screen shown while connecting, resetting or closing.
    fn display_loading(&mut self, progress: &LoadingProgress);

    /// Keeps the UI responsive. Called regularly from every loop of the session.
    fn pump_messages(&mut self);
}

/// The digital pad state of one player for one frame: one bit per button.
///
/// ```
/// use rollback_netplay::PadInput;
///
/// let pad = PadInput::from_bind_values(&[0.0, 0.3, 0.25, 0.1]);
/// assert!(!pad.is_pressed(0));
/// assert!(pad.is_pressed(1));
/// assert!(pad.is_pressed(2));
/// assert_eq!(pad.bind_state(3), 0.0);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PadInput {
    /// Bit `i` is set when button `i` is held.
    pub buttons: u32,
}

impl PadInput {
    /// Thresholds analog bind values at [`PRESS_THRESHOLD`]. Binds past 32 are ignored.
    #[must_use]
    pub fn from_bind_values(values: &[f32]) -> Self {
        let buttons = values
            .iter()
            .take(32)
            .enumerate()
            .filter(|(_, &value)| value >= PRESS_THRESHOLD)
            .fold(0u32, |acc, (bit, _)| acc | (1 << bit));
        Self { buttons }
    }

    /// Whether button `bind` is held.
    #[must_use]
    pub fn is_pressed(self, bind: u32) -> bool {
        bind < 32 && self.buttons & (1 << bind) != 0
    }

    /// The bind value to feed the emulated pad: `1.0` when held, `0.0` otherwise.
    #[must_use]
    pub fn bind_state(self, bind: u32) -> f32 {
        if self.is_pressed(bind) {
            1.0
        } else {
            0.0
        }
    }
}

/// A setting value in a [`SettingsOverlay`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettingValue {
    /// Text.
    Str(String),
    /// Integer.
    Int(i64),
    /// Flag.
    Bool(bool),
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Int(i) => write!(f, "{i}"),
            Self::Bool(b) => f.write_str(if *b { "true" } else { "false" }),
        }
    }
}

/// Settings forced while a session is active, keyed by `(section, key)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsOverlay {
    values: BTreeMap<(String, String), SettingValue>,
}

impl SettingsOverlay {
    /// An empty overlay.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The overlay every session applies: a digital pad on every port, and no runahead,
    /// rewind or other feature that would make frames non-deterministic or unsaveable.
    #[must_use]
    pub fn netplay_defaults() -> Self {
        let mut overlay = Self::new();
        for port in 1..=crate::MAX_PLAYERS {
            overlay.set(
                &format!("Pad{port}"),
                "Type",
                SettingValue::Str("DigitalController".to_owned()),
            );
        }
        overlay.set("Main", "RunaheadFrameCount", SettingValue::Int(0));
        overlay.set("Main", "RewindEnable", SettingValue::Bool(false));
        overlay.set("CPU", "RecompilerBlockLinking", SettingValue::Bool(false));
        overlay.set("GPU", "UseSoftwareRendererForReadbacks", SettingValue::Bool(true));
        overlay
    }

    /// Sets a value, replacing any previous one.
    pub fn set(&mut self, section: &str, key: &str, value: SettingValue) {
        self.values
            .insert((section.to_owned(), key.to_owned()), value);
    }

    /// Looks a value up.
    #[must_use]
    pub fn get(&self, section: &str, key: &str) -> Option<&SettingValue> {
        self.values.get(&(section.to_owned(), key.to_owned()))
    }

    /// Every `(section, key, value)`, sorted.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &SettingValue)> {
        self.values
            .iter()
            .map(|((section, key), value)| (section.as_str(), key.as_str(), value))
    }

    /// Number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if the overlay sets nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn threshold_is_inclusive() {
        let pad = PadInput::from_bind_values(&[0.249, 0.25, 1.0]);
        assert_eq!(pad.buttons, 0b110);
    }

    #[test]
    fn out_of_range_binds_are_never_pressed() {
        let pad = PadInput { buttons: u32::MAX };
        assert!(pad.is_pressed(31));
        assert!(!pad.is_pressed(32));
        assert_eq!(pad.bind_state(40), 0.0);
    }

    #[test]
    fn netplay_defaults_cover_every_port() {
        let overlay = SettingsOverlay::netplay_defaults();
        for port in 1..=crate::MAX_PLAYERS {
            assert_eq!(
                overlay.get(&format!("Pad{port}"), "Type"),
                Some(&SettingValue::Str("DigitalController".to_owned()))
            );
        }
        assert_eq!(
            overlay.get("Main", "RewindEnable"),
            Some(&SettingValue::Bool(false))
        );
        assert_eq!(
            overlay.get("Main", "RunaheadFrameCount"),
            Some(&SettingValue::Int(0))
        );
        assert_eq!(overlay.len(), crate::MAX_PLAYERS + 4);
    }

    #[test]
    fn setting_twice_replaces() {
        let mut overlay = SettingsOverlay::new();
        overlay.set("Main", "Speed", SettingValue::Int(1));
        overlay.set("Main", "Speed", SettingValue::Int(2));
        assert_eq!(overlay.len(), 1);
        assert_eq!(overlay.get("Main", "Speed").unwrap().to_string(), "2");
        assert_eq!(overlay.get("Main", "Missing"), None);
    }

    #[test]
    fn overlay_serializes_for_settings_layers() {
        let overlay = SettingsOverlay::netplay_defaults();
        let json = serde_json::to_string(&overlay.iter().collect::<Vec<_>>()).unwrap();
        assert!(json.contains("RecompilerBlockLinking"));
    }

    proptest! {
        #[test]
        fn pressed_bits_match_values(values in proptest::collection::vec(0.0f32..1.0, 0..40)) {
            let pad = PadInput::from_bind_values(&values);
            for (bind, value) in values.iter().enumerate().take(32) {
                prop_assert_eq!(pad.is_pressed(bind as u32), *value >= PRESS_THRESHOLD);
            }
        }
    }
}
