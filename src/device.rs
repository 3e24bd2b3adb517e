//! The device every command is directed at, and the shell helpers built on top of the runner.

use std::sync::Arc;

use log::debug;
use tokio::sync::OnceCell;

use crate::{
    adb::{AdbCommand, AdbError, CommandOutput, Runner},
    config::Config,
    error::{CliError, Result},
};

/// Settings commands fail silently below this API level.
pub const MIN_API_FOR_SETTINGS: u32 = 19;

/// `('_' << 24) | ('S' << 16) | ('P' << 8) | 'R'`, makes the activity service reload system
/// properties.
const UPDATE_ACTIVITY_SERVICE_CMD: &str = "service call activity 1599295570";

/// Handle to the selected device. Cheap to clone, and shared with the package inspection tasks.
#[derive(Clone)]
pub struct Device {
    runner: Arc<dyn Runner>,
    api_version: Arc<OnceCell<u32>>,
    exit_code_api_floor: u32,
}

impl Device {
    pub fn new(runner: Arc<dyn Runner>, config: &Config) -> Self {
        Self {
            runner,
            api_version: Arc::new(OnceCell::new()),
            exit_code_api_floor: config.exit_code_api_floor,
        }
    }

    pub async fn execute(&self, command: AdbCommand) -> Result<CommandOutput, AdbError> {
        let raw = self.runner.run(&command).await?;
        CommandOutput::from_raw(raw, self.runner.tool(), command.ignores_stderr())
    }

    /// Runs the command until it finishes or the user presses Ctrl+C, in which case `None` is
    /// returned.
    pub async fn execute_until_interrupted(
        &self,
        command: AdbCommand,
    ) -> Result<Option<CommandOutput>, AdbError> {
        match self.runner.run_until_interrupted(&command).await? {
            Some(raw) => Ok(Some(CommandOutput::from_raw(
                raw,
                self.runner.tool(),
                command.ignores_stderr(),
            )?)),
            None => Ok(None),
        }
    }

    /// `adb shell <command>`
    pub async fn shell(&self, command: impl Into<String>) -> Result<CommandOutput, AdbError> {
        self.execute(AdbCommand::shell(command)).await
    }

    /// `adb <command>`
    pub async fn host(&self, command: impl Into<String>) -> Result<CommandOutput, AdbError> {
        self.execute(AdbCommand::host(command)).await
    }

    pub async fn getprop(&self, name: &str, serial: Option<&str>) -> Result<Option<String>> {
        let output = self
            .execute(AdbCommand::shell(format!("getprop {name}")).on_serial(serial))
            .await?;
        Ok(output.stdout)
    }

    /// API level of the selected device, queried once.
    pub async fn api_version(&self) -> Result<u32> {
        self.api_version
            .get_or_try_init(|| self.query_api_version(None))
            .await
            .copied()
    }

    /// API level of a specific device, bypassing the cache.
    pub async fn api_version_of(&self, serial: Option<&str>) -> Result<u32> {
        match serial {
            None => self.api_version().await,
            Some(_) => self.query_api_version(serial).await,
        }
    }

    async fn query_api_version(&self, serial: Option<&str>) -> Result<u32> {
        let version = self.getprop("ro.build.version.sdk", serial).await?;
        version
            .as_deref()
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| {
                CliError::failed("Unable to get Android device version, is it still connected?")
            })
    }

    /// Fails unless the selected device is at least on API `min`.
    pub async fn require_api(&self, min: u32) -> Result<()> {
        self.require_api_on(min, None).await
    }

    pub async fn require_api_on(&self, min: u32, serial: Option<&str>) -> Result<()> {
        let actual = self.api_version_of(serial).await?;
        if actual < min {
            return Err(CliError::ApiTooLow {
                required: min,
                actual,
            });
        }
        Ok(())
    }

    /// Whether a zero exit code from `adb shell` means success on this device.
    pub async fn exit_code_trusted(&self) -> Result<bool> {
        Ok(self.api_version().await? >= self.exit_code_api_floor)
    }

    /// `adb shell settings <command>`
    pub async fn settings(&self, command: &str) -> Result<CommandOutput> {
        self.settings_on(command, None).await
    }

    pub async fn settings_on(&self, command: &str, serial: Option<&str>) -> Result<CommandOutput> {
        self.require_api_on(MIN_API_FOR_SETTINGS, serial).await?;
        Ok(self
            .execute(AdbCommand::shell(format!("settings {command}")).on_serial(serial))
            .await?)
    }

    /// Makes running apps pick up changed system properties.
    pub async fn poke_activity_service(&self) -> Result<()> {
        self.shell(UPDATE_ACTIVITY_SERVICE_CMD).await?;
        Ok(())
    }

    pub async fn shell_and_poke(&self, command: &str) -> Result<CommandOutput> {
        let output = self.shell(command).await?;
        self.poke_activity_service().await?;
        Ok(output)
    }

    pub async fn settings_and_poke(&self, command: &str) -> Result<CommandOutput> {
        let output = self.settings(command).await?;
        self.poke_activity_service().await?;
        Ok(output)
    }

    pub async fn package_exists(&self, package: &str) -> Result<bool> {
        let output = self.shell(format!("pm path {package}")).await?;
        Ok(output.success() && output.stdout.is_some())
    }

    pub async fn ensure_package_exists(&self, package: &str) -> Result<()> {
        if !self.package_exists(package).await? {
            return Err(CliError::PackageNotFound(package.to_owned()));
        }
        debug!("Package {package} exists");
        Ok(())
    }

    /// Whether the device is an emulator.
    pub async fn is_emulator(&self) -> Result<bool> {
        Ok(self.getprop("ro.kernel.qemu", None).await?.as_deref() == Some("1"))
    }
}


#[cfg(test)]
mod test {
    use super::testing::{fail, ok, scripted};
    use crate::{adb::AdbError, error::CliError};

    #[tokio::test]
    async fn api_version_is_cached() {
        let (device, runner) = scripted(|cmd| match cmd {
            "shell getprop ro.build.version.sdk" => ok("30\n"),
            _ => ok(""),
        });
        assert_eq!(30, device.api_version().await.unwrap());
        assert_eq!(30, device.api_version().await.unwrap());
        assert_eq!(1, runner.calls().len());
    }

    #[tokio::test]
    async fn api_version_missing() {
        let (device, _) = scripted(|_| ok(""));
        assert!(matches!(
            device.api_version().await,
            Err(CliError::Failed(_))
        ));
    }

    #[tokio::test]
    async fn require_api_too_low() {
        let (device, _) = scripted(|_| ok("18"));
        match device.require_api(19).await {
            Err(CliError::ApiTooLow { required, actual }) => {
                assert_eq!((19, 18), (required, actual))
            }
            other => panic!("Unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn settings_checks_api_first() {
        let (device, runner) = scripted(|_| ok("16"));
        assert!(device.settings("get global wifi_on").await.is_err());
        assert_eq!(
            vec!["shell getprop ro.build.version.sdk"],
            runner.calls()
        );
    }

    #[tokio::test]
    async fn package_exists_requires_output() {
        let (device, _) = scripted(|cmd| match cmd {
            "shell pm path com.example.app" => ok("package:/data/app/com.example.app/base.apk"),
            _ => fail(1, ""),
        });
        assert!(device.package_exists("com.example.app").await.unwrap());
        assert!(!device.package_exists("com.example.missing").await.unwrap());
        assert!(matches!(
            device.ensure_package_exists("com.example.missing").await,
            Err(CliError::PackageNotFound(p)) if p == "com.example.missing"
        ));
    }

    #[tokio::test]
    async fn multiple_devices_is_fatal_for_any_command() {
        let (device, _) = scripted(|_| fail(1, "error: more than one device/emulator"));
        assert!(matches!(
            device.shell("input keyevent 4").await,
            Err(AdbError::MultipleDevices)
        ));
    }
}
