use std::fmt;

use crate::error::CliError;

/// Below this API level `adb shell` exits with 0 even when the shell command failed.
pub const DEFAULT_EXIT_CODE_API_FLOOR: u32 = 24;

/// Which device the tool prefix directs commands to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum DeviceSelection {
    /// Let adb pick, honoring `ANDROID_SERIAL`.
    #[default]
    Default,
    /// `-e`: the only running emulator.
    Emulator,
    /// `-d`: the only USB-connected device.
    Usb,
    /// `-s <serial>`
    Serial(String),
}

impl DeviceSelection {
    /// Builds the selection from the `-e`, `-d` and `-s` flags, of which at most one may be set.
    pub fn from_flags(
        emulator: bool,
        usb: bool,
        serial: Option<String>,
    ) -> Result<Self, CliError> {
        match (emulator, usb, serial) {
            (false, false, None) => Ok(Self::Default),
            (true, false, None) => Ok(Self::Emulator),
            (false, true, None) => Ok(Self::Usb),
            (false, false, Some(serial)) => Ok(Self::Serial(serial)),
            _ => Err(CliError::ConflictingDeviceSelection),
        }
    }

    /// The flags to put after the tool name.
    pub fn flags(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for DeviceSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => Ok(()),
            Self::Emulator => f.write_str("-e"),
            Self::Usb => f.write_str("-d"),
            Self::Serial(serial) => write!(f, "-s {serial}"),
        }
    }
}

/// How per-package checks are scheduled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InspectionMode {
    #[default]
    Parallel,
    /// One package at a time, with progress output.
    Sequential,
}

/// Settings resolved once from the command line and environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub adb_path: String,
    pub selection: DeviceSelection,
    pub verbose: bool,
    /// Minimum device API level at which a zero exit code of `adb shell` can be trusted.
    pub exit_code_api_floor: u32,
    pub inspection: InspectionMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            adb_path: "adb".into(),
            selection: DeviceSelection::Default,
            verbose: false,
            exit_code_api_floor: DEFAULT_EXIT_CODE_API_FLOOR,
            inspection: InspectionMode::Parallel,
        }
    }
}
