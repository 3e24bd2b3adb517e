//! Utilities for running commands through the Android Debug Bridge.
//!
//! Everything that talks to a device goes through a [`Runner`], which spawns one `adb` command
//! line and captures its raw output. [`CommandOutput::from_raw`] then normalizes stdout and turns
//! the few stderr messages that make every further command pointless into an [`AdbError`].

use std::{
    fmt,
    io::BufRead,
    path::PathBuf,
    process::{Output, Stdio},
    sync::OnceLock,
};

use async_trait::async_trait;
use log::{debug, warn};
use thiserror::Error;
use tokio::process::Command;

use crate::config::DeviceSelection;

static ADB_PATH: OnceLock<PathBuf> = OnceLock::new();

/// Lines some firmwares print on every shell command. They never carry information.
const IGNORED_LINES: &[&str] = &[
    "WARNING: linker: libdvm.so has text relocations. This is wasting memory and is a security risk. Please fix.",
];

#[derive(Error, Debug)]
pub enum AdbError {
    #[error(
        "ADB (Android debug bridge) command not found.\n\
         Install ADB via https://developer.android.com/studio/releases/platform-tools.html"
    )]
    ToolNotFound,

    #[error(
        "More than one device/emulator are connected.\n\
         Please select a device by providing the serial ID (-s parameter).\n\
         You can list all connected devices/emulators via \"devices\" subcommand."
    )]
    MultipleDevices,

    #[error("{0}")]
    DeviceNotFound(String),

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

/// One invocation of the device tool: `[-s <serial>] [shell] <command> [| <piped_into>]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdbCommand {
    command: String,
    shell: bool,
    piped_into: Option<String>,
    ignore_stderr: bool,
    serial: Option<String>,
}

impl AdbCommand {
    /// A command run inside `adb shell` on the device.
    pub fn shell(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            shell: true,
            piped_into: None,
            ignore_stderr: false,
            serial: None,
        }
    }

    /// A command run by the host-side tool itself, e.g. `pull` or `devices -l`.
    pub fn host(command: impl Into<String>) -> Self {
        Self {
            shell: false,
            ..Self::shell(command)
        }
    }

    /// Pipes stdout into a second command running on the host.
    pub fn piped_into(mut self, command: impl Into<String>) -> Self {
        self.piped_into = Some(command.into());
        self
    }

    /// Don't forward stderr to the user. Fatal stderr messages are still detected.
    pub fn ignore_stderr(mut self) -> Self {
        self.ignore_stderr = true;
        self
    }

    /// Sends this command to the given serial instead of the configured device.
    pub fn on_serial(mut self, serial: Option<&str>) -> Self {
        self.serial = serial.map(str::to_owned);
        self
    }

    pub fn ignores_stderr(&self) -> bool {
        self.ignore_stderr
    }

    pub fn is_piped(&self) -> bool {
        self.piped_into.is_some()
    }

    /// The full command line handed to the platform shell.
    pub fn command_line(&self, prefix: &AdbPrefix) -> String {
        format!("{prefix} {self}")
    }
}

impl fmt::Display for AdbCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(serial) = &self.serial {
            write!(f, "-s {serial} ")?;
        }
        if self.shell {
            f.write_str("shell ")?;
        }
        f.write_str(&self.command)?;
        if let Some(piped_into) = &self.piped_into {
            write!(f, " | {piped_into}")?;
        }
        Ok(())
    }
}

/// The tool plus the device selector every command is prefixed with, e.g. `adb -s emulator-5554`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdbPrefix {
    pub tool: String,
    pub selection: DeviceSelection,
}

impl fmt::Display for AdbPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tool.contains(char::is_whitespace) {
            write!(f, "\"{}\"", self.tool)?;
        } else {
            f.write_str(&self.tool)?;
        }
        match self.selection.flags() {
            flags if flags.is_empty() => Ok(()),
            flags => write!(f, " {flags}"),
        }
    }
}

/// Exit code and undecoded output streams of one command.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawOutput {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl From<Output> for RawOutput {
    fn from(output: Output) -> Self {
        Self {
            // Killed by a signal
            status: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }
}

/// The normalized result of a command.
///
/// `stdout` is `None` when the command printed nothing but blank or ignored lines, so callers
/// can tell "no output" apart from an empty string they produced themselves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: Option<String>,
    pub stderr: String,
}

impl CommandOutput {
    /// Decodes and normalizes the raw output, failing on stderr messages that mean the tool is
    /// missing or the target device is ambiguous or gone.
    pub fn from_raw(raw: RawOutput, tool: &str, ignore_stderr: bool) -> Result<Self, AdbError> {
        let stdout = decode(raw.stdout, "stdout");
        let stderr = decode(raw.stderr, "stderr");
        if let Some(e) = classify_stderr(&stderr, tool) {
            return Err(e);
        }
        if !ignore_stderr && !stderr.trim().is_empty() {
            warn!("{}", stderr.trim_end());
        }
        let stdout = normalize_stdout(&stdout);
        debug!("Result is {stdout:?}");
        Ok(Self {
            exit_code: raw.status,
            stdout,
            stderr,
        })
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout, or an empty string when there was none.
    pub fn text(&self) -> &str {
        self.stdout.as_deref().unwrap_or_default()
    }
}

fn decode(bytes: Vec<u8>, stream: &str) -> String {
    String::from_utf8(bytes).unwrap_or_else(|e| {
        warn!("Unable to decode {stream} as UTF-8, passing the raw data through");
        String::from_utf8_lossy(e.as_bytes()).into_owned()
    })
}

/// Trims every line and drops blank and ignored ones. Returns `None` if nothing survives.
pub fn normalize_stdout(stdout: &str) -> Option<String> {
    let lines: Vec<&str> = stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !IGNORED_LINES.contains(line))
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/// Maps the stderr of a command onto the errors no command can recover from.
///
/// This is the only place that knows the tool's diagnostic wording.
pub fn classify_stderr(stderr: &str, tool: &str) -> Option<AdbError> {
    let trailer = stderr.trim();
    if trailer.is_empty() {
        return None;
    }
    if trailer.ends_with(&format!("{tool}: command not found"))
        || trailer.ends_with(&format!("{tool}: not found"))
        || trailer.starts_with(&format!("'{tool}' is not recognized"))
    {
        return Some(AdbError::ToolNotFound);
    }
    let lines = || trailer.lines().map(str::trim).filter(|l| !l.is_empty());
    for line in lines() {
        debug!("{line}");
    }
    if lines().any(|line| line.contains("error: more than one")) {
        return Some(AdbError::MultipleDevices);
    }
    lines()
        .find(|line| line.contains("error: device") && line.contains("not found"))
        .map(|line| AdbError::DeviceNotFound(line.to_owned()))
}

/// Spawns device tool command lines and captures their output.
#[async_trait]
pub trait Runner: Send + Sync {
    /// The tool name as the platform shell reports it when it cannot be found.
    fn tool(&self) -> &str;

    async fn run(&self, command: &AdbCommand) -> Result<RawOutput, AdbError>;

    /// Like [`Runner::run`], but returns `None` if the user pressed Ctrl+C before the command
    /// finished. The command is terminated in that case.
    async fn run_until_interrupted(
        &self,
        command: &AdbCommand,
    ) -> Result<Option<RawOutput>, AdbError> {
        self.run(command).await.map(Some)
    }
}

/// The real runner, which goes through the platform shell so pipes and device-side quoting work
/// the same way they read.
#[derive(Clone, Debug)]
pub struct Adb {
    prefix: AdbPrefix,
}

impl Adb {
    pub fn new(tool: impl Into<String>, selection: DeviceSelection) -> Self {
        Self {
            prefix: AdbPrefix {
                tool: tool.into(),
                selection,
            },
        }
    }

    fn spawn(&self, command: &AdbCommand) -> std::io::Result<tokio::process::Child> {
        let command_line = command.command_line(&self.prefix);
        debug!("Executing \"{command_line}\"");
        platform_shell(&command_line, !command.is_piped())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }
}

#[async_trait]
impl Runner for Adb {
    fn tool(&self) -> &str {
        &self.prefix.tool
    }

    async fn run(&self, command: &AdbCommand) -> Result<RawOutput, AdbError> {
        let output = self.spawn(command)?.wait_with_output().await?;
        Ok(output.into())
    }

    async fn run_until_interrupted(
        &self,
        command: &AdbCommand,
    ) -> Result<Option<RawOutput>, AdbError> {
        let child = self.spawn(command)?;
        tokio::select! {
            output = child.wait_with_output() => Ok(Some(output?.into())),
            // Dropping the child kills it.
            _ = tokio::signal::ctrl_c() => {
                debug!("Interrupted, terminating \"{command}\"");
                Ok(None)
            }
        }
    }
}

#[cfg(unix)]
fn platform_shell(command_line: &str, exec: bool) -> Command {
    let mut cmd = Command::new("sh");
    if exec {
        // Replace the shell so that killing the child kills adb itself.
        cmd.args(["-c", &format!("exec {command_line}")]);
    } else {
        cmd.args(["-c", command_line]);
    }
    cmd
}

#[cfg(windows)]
fn platform_shell(command_line: &str, _exec: bool) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.args(["/C", command_line]);
    cmd
}

/// Finds the adb executable, caching the result for the rest of the process.
pub async fn get_adb_path() -> &'static PathBuf {
    if let Some(adb_path) = ADB_PATH.get() {
        return adb_path;
    }

    async fn find_adb_path() -> PathBuf {
        if let Ok(adb_path) = which::which("adb") {
            return adb_path;
        }
        Command::new("sh")
            .args(["-l", "-c", "which adb"])
            .output()
            .await
            .map(|output| {
                output
                    .stdout
                    .lines()
                    .next()
                    .and_then(|r| r.ok())
                    .filter(|line| !line.is_empty())
                    .unwrap_or("adb".into())
                    .into()
            })
            .unwrap_or("adb".into())
    }

    let adb_path = find_adb_path().await;
    ADB_PATH.get_or_init(|| adb_path)
}
