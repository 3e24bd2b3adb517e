//! Listing, inspecting and controlling installed packages.

use std::{collections::BTreeSet, path::Path, time::Duration};

use anyhow::Context;
use clap::ValueEnum;
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;
use tokio::{
    process::Command,
    task::JoinHandle,
    time::{sleep, timeout},
};

use crate::{
    adb::{AdbCommand, AdbError, CommandOutput},
    config::InspectionMode,
    device::Device,
    error::{CliError, Result},
    inspect::{filter_parallel, filter_sequential},
    output::{print_error, print_message, print_progress},
    screen,
};

const REGEX_DEBUGGABLE: &str = "(pkgFlags|flags).*DEBUGGABLE";
const REGEX_BACKUP_ALLOWED: &str = "(pkgFlags|flags).*ALLOW_BACKUP";

const MIN_API_FOR_RUNTIME_PERMISSIONS: u32 = 23;
const MIN_API_FOR_STANDBY_BUCKETS: u32 = 28;

lazy_static! {
    static ref DUMPSYS_PACKAGE: Regex = Regex::new(r"Package \[(.*?)\]").unwrap();
    static ref DEBUGGABLE: Regex = Regex::new(&format!("(?i){REGEX_DEBUGGABLE}")).unwrap();
    static ref VERSION_CODE: Regex = Regex::new(r"(?i)versionCode=(\d+)?").unwrap();
    static ref VERSION_NAME: Regex = Regex::new(r"(?i)versionName=([\d.]+)?").unwrap();
    static ref MIN_SDK: Regex = Regex::new(r"(?i)minSdk=(\d+)?").unwrap();
    static ref TARGET_SDK: Regex = Regex::new(r"(?i)targetSdk=(\d+)?").unwrap();
    static ref MAX_SDK: Regex = Regex::new(r"(?i)maxSdk=(\d+)?").unwrap();
    static ref INSTALLER: Regex = Regex::new(r"(?i)installerPackageName=(\S+)?").unwrap();
    static ref GRANTED_PERMISSIONS: Regex = Regex::new(r"(?is)grantedPermissions:(.*)").unwrap();
    static ref REQUESTED_PERMISSIONS: Regex =
        Regex::new(r"(?is)requested permissions:(.*?)install permissions:").unwrap();
    static ref REQUESTED_PERMISSIONS_FALLBACK: Regex =
        Regex::new(r"(?is)requested permissions:(.*?)runtime permissions:").unwrap();
    static ref INSTALL_PERMISSIONS: Regex =
        Regex::new(r"(?is)install permissions:(.*?)runtime permissions:").unwrap();
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum AppsFilter {
    All,
    System,
    ThirdParty,
    Debug,
    BackupEnabled,
}

/// <https://developer.android.com/reference/android/app/usage/UsageStatsManager#STANDBY_BUCKET_ACTIVE>
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum StandbyBucket {
    Active,
    #[value(name = "working_set")]
    WorkingSet,
    Frequent,
    Rare,
}

impl StandbyBucket {
    fn from_code(code: u32) -> Option<Self> {
        match code {
            10 => Some(Self::Active),
            20 => Some(Self::WorkingSet),
            30 => Some(Self::Frequent),
            40 => Some(Self::Rare),
            _ => None,
        }
    }

    fn as_arg(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::WorkingSet => "working_set",
            Self::Frequent => "frequent",
            Self::Rare => "rare",
        }
    }

    fn display_name(self) -> &'static str {
        match self {
            Self::WorkingSet => "working",
            other => other.as_arg(),
        }
    }
}

/// Package names from `pm list packages` style output (`package:<name>` per line).
fn parse_package_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(_, package)| package.trim().to_owned())
        .collect()
}

async fn packages(device: &Device, pm_cmd: &str) -> Result<Vec<String>> {
    let output = device.shell(pm_cmd).await?;
    if !output.success() {
        return Err(CliError::failed(format!(
            "Command \"{pm_cmd}\" failed, something is wrong"
        )));
    }
    Ok(parse_package_list(output.text()))
}

/// `dumpsys package` lists packages that `pm list packages` sometimes misses.
async fn all_packages(device: &Device) -> Result<Vec<String>> {
    let cmd = "dumpsys package";
    let output = device.shell(cmd).await?;
    if !output.success() {
        return Err(CliError::failed(format!(
            "Command \"{cmd}\" failed, something is wrong"
        )));
    }
    let unique: BTreeSet<String> = DUMPSYS_PACKAGE
        .captures_iter(output.text())
        .map(|cap| cap[1].to_owned())
        .collect();
    Ok(unique.into_iter().collect())
}

/// Whether `dumpsys package <package>` has a line matching `flag_regex`. The count is taken on
/// the device side so only a number comes back.
async fn package_has_flag(
    device: Device,
    package: String,
    flag_regex: &'static str,
) -> Result<(String, bool)> {
    let pm_cmd = format!("dumpsys package {package}");
    let grep_cmd = format!("(grep -c -E '{flag_regex}' || true)");
    let output = device
        .execute(AdbCommand::shell(&pm_cmd).piped_into(&grep_cmd))
        .await?;
    let Some(count) = output.stdout.as_deref().map(str::trim) else {
        return Ok((package, false));
    };
    match count.parse::<u64>() {
        Ok(n) => Ok((package, n > 0)),
        Err(_) => Err(CliError::failed(format!(
            "Unexpected output for {pm_cmd} | {grep_cmd} = \"{count}\""
        ))),
    }
}

async fn packages_with_flag(
    device: &Device,
    flag_regex: &'static str,
    mode: InspectionMode,
) -> Result<Vec<String>> {
    let candidates = packages(device, "pm list packages").await?;
    debug!("Inspecting {} packages for {flag_regex}", candidates.len());
    let predicate = |package: String| package_has_flag(device.clone(), package, flag_regex);
    let mut matches = match mode {
        InspectionMode::Parallel => filter_parallel(candidates, predicate).await?,
        InspectionMode::Sequential => {
            filter_sequential(candidates, predicate, print_progress).await?
        }
    };
    matches.sort();
    Ok(matches)
}

pub async fn list_apps(device: &Device, filter: AppsFilter, mode: InspectionMode) -> Result<()> {
    let apps = match filter {
        AppsFilter::All => all_packages(device).await?,
        AppsFilter::System => packages(device, "pm list packages -s").await?,
        AppsFilter::ThirdParty => packages(device, "pm list packages -3").await?,
        AppsFilter::Debug => packages_with_flag(device, REGEX_DEBUGGABLE, mode).await?,
        AppsFilter::BackupEnabled => {
            packages_with_flag(device, REGEX_BACKUP_ALLOWED, mode).await?
        }
    };
    if apps.is_empty() {
        debug!("No packages match {filter:?}");
        return Ok(());
    }
    print_message(&apps.join("\n"));
    Ok(())
}

fn extract(regex: &Regex, data: &str) -> Option<String> {
    regex
        .captures(data)
        .and_then(|cap| cap.get(1))
        .map(|m| m.as_str().to_owned())
}

fn non_empty_lines(section: &str) -> Vec<String> {
    section
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Permission state of one package, as scraped from `dumpsys package <package>`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PermissionsInfo {
    pub install_granted: Vec<String>,
    pub install_denied: Vec<String>,
    pub runtime_granted: Vec<String>,
    pub runtime_denied: Vec<String>,
    /// Requested in the manifest, but never asked for at runtime.
    pub runtime_not_requested: Vec<String>,
}

impl PermissionsInfo {
    /// Parses the dump of a device with runtime permissions (API 23+).
    pub fn from_dump(dump: &str) -> Self {
        let requested = REQUESTED_PERMISSIONS
            .captures(dump)
            .or_else(|| REQUESTED_PERMISSIONS_FALLBACK.captures(dump))
            .map(|cap| non_empty_lines(&cap[1]))
            .unwrap_or_default();

        let mut info = Self::default();
        for line in INSTALL_PERMISSIONS
            .captures(dump)
            .map(|cap| non_empty_lines(&cap[1]))
            .unwrap_or_default()
        {
            let permission = line.split(':').next().unwrap_or_default().to_owned();
            if line.contains("granted=true") {
                info.install_granted.push(permission);
            } else if line.contains("granted=false") {
                info.install_denied.push(permission);
            }
        }

        for permission in requested {
            if info.install_granted.contains(&permission)
                || info.install_denied.contains(&permission)
            {
                continue;
            }
            if dump.contains(&format!("{permission}: granted=true")) {
                info.runtime_granted.push(permission);
            } else if dump.contains(&format!("{permission}: granted=false")) {
                info.runtime_denied.push(permission);
            } else {
                info.runtime_not_requested.push(permission);
            }
        }
        info
    }

    /// Whether the package requests `permission` at all.
    pub fn mentions(&self, permission: &str) -> bool {
        [
            &self.install_granted,
            &self.install_denied,
            &self.runtime_granted,
            &self.runtime_denied,
            &self.runtime_not_requested,
        ]
        .iter()
        .any(|list| list.iter().any(|p| p == permission))
    }

    fn describe(&self) -> String {
        let mut msg = String::from("\nPermissions:\n\n");
        for (title, list) in [
            ("Install time granted permissions", &self.install_granted),
            ("Install time denied permissions", &self.install_denied),
            ("Runtime granted permissions", &self.runtime_granted),
            ("Runtime denied permissions", &self.runtime_denied),
            (
                "Runtime Permissions not granted and not yet requested",
                &self.runtime_not_requested,
            ),
        ] {
            if !list.is_empty() {
                msg += &format!("{title}:\n{}\n\n", list.join("\n"));
            }
        }
        msg
    }
}

/// Below API 23 everything is granted at install time.
fn describe_legacy_permissions(dump: &str) -> String {
    let granted = GRANTED_PERMISSIONS
        .captures(dump)
        .map(|cap| non_empty_lines(&cap[1]))
        .unwrap_or_default();
    if granted.is_empty() {
        String::new()
    } else {
        format!("Install time granted permissions:\n{}\n\n", granted.join("\n"))
    }
}

/// Fields missing from the dump are shown as `None`.
fn describe_app(package: &str, dump: &str, api_version: u32) -> String {
    let show = |value: Option<String>| value.unwrap_or_else(|| "None".to_owned());
    let mut msg = format!(
        "App name: {package}\nVersion: {}\nVersion Code: {}\nIs debuggable: {}\nMin SDK version: {}\nTarget SDK version: {}\n",
        show(extract(&VERSION_NAME, dump)),
        show(extract(&VERSION_CODE, dump)),
        DEBUGGABLE.is_match(dump),
        show(extract(&MIN_SDK, dump)),
        show(extract(&TARGET_SDK, dump)),
    );
    if let Some(max_sdk) = extract(&MAX_SDK, dump) {
        msg += &format!("Max SDK version: {max_sdk}\n");
    }
    if api_version >= MIN_API_FOR_RUNTIME_PERMISSIONS {
        msg += &PermissionsInfo::from_dump(dump).describe();
    } else {
        msg += &describe_legacy_permissions(dump);
    }
    msg += &format!(
        "Installer package name: {}\n",
        show(extract(&INSTALLER, dump))
    );
    msg
}

pub async fn dump_package(device: &Device, package: &str) -> Result<String> {
    Ok(device
        .shell(format!("dumpsys package {package}"))
        .await?
        .stdout
        .unwrap_or_default())
}

/// `pm dump` prints about 1200 lines, this is the useful part of them.
pub async fn app_info(device: &Device, package: &str) -> Result<()> {
    device.ensure_package_exists(package).await?;
    let dump = dump_package(device, package).await?;
    let api_version = device.api_version().await?;
    print_message(&describe_app(package, &dump, api_version));
    Ok(())
}

async fn apk_path(device: &Device, package: &str) -> Result<String> {
    let output = device.shell(format!("pm path {package}")).await?;
    output
        .text()
        .lines()
        .next()
        .and_then(|line| line.split_once(':'))
        .map(|(_, path)| path.trim().to_owned())
        .ok_or_else(|| CliError::failed(format!("Unable to find the APK of {package}")))
}

pub async fn app_path(device: &Device, package: &str) -> Result<()> {
    device.ensure_package_exists(package).await?;
    let path = apk_path(device, package).await?;
    debug!("Path for {package} is {path}");
    print_message(&path);
    Ok(())
}

pub async fn app_signature(device: &Device, package: &str) -> Result<()> {
    device.ensure_package_exists(package).await?;
    let path = apk_path(device, package).await?;
    let apksigner = which::which("apksigner").map_err(|_| {
        CliError::failed(
            "apksigner not found, install the Android SDK build-tools and add them to PATH",
        )
    })?;

    let local_apk = tempfile::Builder::new()
        .prefix(package)
        .suffix(".apk")
        .tempfile()
        .context("Failed to create a temporary file for the APK")?;
    let local_path = local_apk.path().display().to_string();
    let output = device
        .host(format!("pull {path} \"{local_path}\""))
        .await?;
    if !output.success() {
        return Err(CliError::failed(format!(
            "Failed to pull file {path}, stderr: {}",
            output.stderr.trim()
        )));
    }

    debug!("Executing {} verify --print-certs {local_path}", apksigner.display());
    let output = Command::new(&apksigner)
        .args(["verify", "--print-certs"])
        .arg(local_apk.path())
        .output()
        .await
        .context("Failed to run apksigner")?;
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        print_message(line.trim());
    }
    for line in String::from_utf8_lossy(&output.stderr).lines() {
        print_error(line.trim());
    }
    if !output.status.success() {
        return Err(CliError::failed(format!(
            "Failed to verify the signature of {package}"
        )));
    }
    Ok(())
}

const BACKUP_PASSWORD: &str = "00";
const BACKUP_CONFIRM_PACKAGE: &str = "com.android.backupconfirm";
const BACKUP_WAIT: Duration = Duration::from_secs(10);
const BACKUP_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Waits for a running `adb backup`, giving it two chances to finish.
async fn wait_for_backup(
    mut backup: JoinHandle<Result<CommandOutput, AdbError>>,
) -> Result<CommandOutput> {
    for attempt in 0..2 {
        match timeout(BACKUP_WAIT, &mut backup).await {
            Ok(joined) => return Ok(joined??),
            Err(_) if attempt == 0 => {
                print_error("Backup failed in first attempt, trying again...")
            }
            Err(_) => {}
        }
    }
    backup.abort();
    Err(CliError::failed("Backup failed"))
}

/// Runs `adb backup` into `ab_file` and waits for the user to confirm it on the device.
async fn create_backup(device: &Device, package: &str, ab_file: &Path) -> Result<()> {
    let backup = tokio::spawn({
        let device = device.clone();
        let cmd = format!("backup -f \"{}\" -noapk {package}", ab_file.display());
        async move { device.host(cmd).await }
    });
    while !backup.is_finished() {
        match screen::top_activity(device).await? {
            Some((app, activity))
                if app == BACKUP_CONFIRM_PACKAGE || activity.contains(BACKUP_CONFIRM_PACKAGE) =>
            {
                debug!("Backup confirmation is showing");
                break;
            }
            _ => sleep(BACKUP_POLL_INTERVAL).await,
        }
    }
    sleep(BACKUP_POLL_INTERVAL).await;
    let output = wait_for_backup(backup).await?;
    if !output.success() {
        return Err(CliError::failed(format!(
            "Backup failed, stderr: {}",
            output.stderr.trim()
        )));
    }
    Ok(())
}

/// Backs up the app's data with `adb backup` and unpacks it with the Android Backup Extractor.
pub async fn app_backup(
    device: &Device,
    package: &str,
    tar_file: &Path,
    abe_jar: Option<&Path>,
) -> Result<()> {
    let java = which::which("java").map_err(|_| {
        CliError::failed("java not found, it is needed to convert the backup to a tar file")
    })?;
    let abe_jar = abe_jar.ok_or_else(|| {
        CliError::failed(
            "Android Backup Extractor jar not set, pass --abe-jar or set ADBE_ABE_JAR",
        )
    })?;
    device.ensure_package_exists(package).await?;

    let backup_dir = tempfile::tempdir().context("Failed to create a directory for the backup")?;
    let ab_file = backup_dir.path().join("backup.ab");
    print_message(&format!(
        "you might have to confirm the backup manually on your device's screen, enter \"{BACKUP_PASSWORD}\" as password..."
    ));
    create_backup(device, package, &ab_file).await?;

    debug!("Executing {} -jar {} unpack", java.display(), abe_jar.display());
    let output = Command::new(&java)
        .arg("-jar")
        .arg(abe_jar)
        .arg("unpack")
        .arg(&ab_file)
        .arg(tar_file)
        .arg(BACKUP_PASSWORD)
        .output()
        .await
        .context("Failed to run the Android Backup Extractor")?;
    if !output.status.success() {
        debug!("{}", String::from_utf8_lossy(&output.stderr).trim());
        return Err(CliError::failed(
            "Failed to convert backup.ab to tar file. Please ensure that it is not password protected",
        ));
    }
    print_message(&format!(
        "Successfully backed up data of app {package} to {}",
        tar_file.display()
    ));
    Ok(())
}

/// <https://stackoverflow.com/a/25398877>
pub async fn launch_app(device: &Device, package: &str) -> Result<()> {
    device.ensure_package_exists(package).await?;
    device
        .shell(format!(
            "monkey -p {package} -c android.intent.category.LAUNCHER 1"
        ))
        .await?;
    Ok(())
}

pub async fn stop_app(device: &Device, package: &str) -> Result<()> {
    device.ensure_package_exists(package).await?;
    // Below API 21 `am kill` leaves a foreground app alone.
    if device.api_version().await? < 21 {
        return force_stop(device, package).await;
    }
    device.shell(format!("am kill {package}")).await?;
    Ok(())
}

pub async fn force_stop(device: &Device, package: &str) -> Result<()> {
    device.ensure_package_exists(package).await?;
    let output = device.shell(format!("am force-stop {package}")).await?;
    if !output.success() {
        return Err(CliError::failed(format!("Failed to stop \"{package}\"")));
    }
    if let Some(stdout) = output.stdout {
        print_message(&stdout);
    }
    Ok(())
}

pub async fn restart_app(device: &Device, package: &str) -> Result<()> {
    force_stop(device, package).await?;
    launch_app(device, package).await
}

pub async fn clear_data(device: &Device, package: &str) -> Result<()> {
    device.ensure_package_exists(package).await?;
    let output = device.shell(format!("pm clear {package}")).await?;
    if !output.success() {
        return Err(CliError::failed(format!(
            "Failed to clear data of \"{package}\""
        )));
    }
    Ok(())
}

pub async fn install(device: &Device, apk: &str) -> Result<()> {
    debug!("Installing {apk}");
    // -r: replace the existing application
    let output = device.host(format!("install -r \"{apk}\"")).await?;
    if !output.success() {
        return Err(CliError::failed(format!(
            "Failed to install {apk}, stderr: {}",
            output.stderr.trim()
        )));
    }
    Ok(())
}

pub async fn uninstall(device: &Device, package: &str, first_user: bool) -> Result<()> {
    device.ensure_package_exists(package).await?;
    debug!("Uninstalling {package}");
    // System apps can't be removed, but they can be uninstalled for user 0.
    // https://www.xda-developers.com/uninstall-carrier-oem-bloatware-without-root-access/
    let user_0_cmd = format!("pm uninstall --user 0 {package}");
    let mut output = if first_user {
        device.shell(&user_0_cmd).await?
    } else {
        device.shell(format!("pm uninstall {package}")).await?
    };
    if !output.success() && !first_user {
        print_message("Uninstall failed, trying to uninstall for user 0...");
        output = device.shell(user_0_cmd).await?;
    }
    if !output.success() {
        return Err(CliError::failed(format!(
            "Failed to uninstall {package}, stderr: {}",
            output.stderr.trim()
        )));
    }
    Ok(())
}

async fn is_app_running(device: &Device, package: &str) -> Result<bool> {
    let output = device.shell("ps -o NAME").await?;
    Ok(output.success() && output.text().contains(package))
}

async fn print_jank(device: &Device, package: &str) -> Result<()> {
    let output = device.shell(format!("dumpsys gfxinfo {package}")).await?;
    let janky = output
        .success()
        .then(|| output.text().lines().find(|line| line.contains("Janky")))
        .flatten();
    match janky {
        Some(line) => print_message(line),
        None => print_error(&format!("No jank information found for {package}")),
    }
    Ok(())
}

/// Jank statistics need a running app, so the app is started first and stopped again afterwards
/// when it wasn't running.
pub async fn jank(device: &Device, package: &str) -> Result<()> {
    let running = is_app_running(device, package).await?;
    if !running {
        debug!("Starting the app {package} to get its jank information");
        launch_app(device, package).await?;
    }
    let result = print_jank(device, package).await;
    if !running {
        debug!("Stopping the app {package} after getting its jank information");
        force_stop(device, package).await?;
    }
    result
}

/// <https://developer.android.com/about/versions/pie/power#buckets>
pub async fn get_standby_bucket(device: &Device, package: &str) -> Result<()> {
    device.ensure_package_exists(package).await?;
    device.require_api(MIN_API_FOR_STANDBY_BUCKETS).await?;
    let output = device
        .shell(format!("am get-standby-bucket {package}"))
        .await?;
    let bucket = output
        .stdout
        .as_deref()
        .and_then(|code| code.trim().parse().ok())
        .and_then(StandbyBucket::from_code)
        .ok_or_else(|| CliError::failed("unknown"))?;
    debug!("App standby bucket for \"{package}\" is {}", bucket.display_name());
    print_message(bucket.display_name());
    Ok(())
}

pub async fn set_standby_bucket(
    device: &Device,
    package: &str,
    bucket: StandbyBucket,
) -> Result<()> {
    device.ensure_package_exists(package).await?;
    device.require_api(MIN_API_FOR_STANDBY_BUCKETS).await?;
    let output = device
        .shell(format!("am set-standby-bucket {package} {}", bucket.as_arg()))
        .await?;
    // Silent on success.
    if let Some(stdout) = output.stdout {
        return Err(CliError::Failed(stdout));
    }
    Ok(())
}

pub async fn restrict_background(device: &Device, package: &str, restrict: bool) -> Result<()> {
    device.ensure_package_exists(package).await?;
    device.require_api(MIN_API_FOR_STANDBY_BUCKETS).await?;
    let mode = if restrict { "ignore" } else { "allow" };
    device
        .shell(format!(
            "cmd appops set {package} RUN_ANY_IN_BACKGROUND {mode}"
        ))
        .await?;
    Ok(())
}

pub async fn set_debug_app(
    device: &Device,
    package: &str,
    wait_for_debugger: bool,
    persistent: bool,
) -> Result<()> {
    device.ensure_package_exists(package).await?;
    let mut cmd = String::from("am set-debug-app");
    if wait_for_debugger {
        cmd += " -w";
    }
    if persistent {
        cmd += " --persistent";
    }
    cmd += &format!(" {package}");
    device.shell(cmd).await?;
    Ok(())
}

pub async fn clear_debug_app(device: &Device) -> Result<()> {
    device.shell("am clear-debug-app").await?;
    Ok(())
}
