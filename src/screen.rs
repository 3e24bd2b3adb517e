//! Screen state, captures and input.

use std::time::Duration;

use clap::ValueEnum;
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;

use crate::{
    adb::AdbCommand,
    device::{Device, MIN_API_FOR_SETTINGS},
    error::{CliError, Result},
    files::create_tmp_file,
    output::{print_error, print_message},
};

const TOGGLE_SCREEN_CMD: &str = "input keyevent KEYCODE_POWER";
const KEYCODE_BACK: u32 = 4;
/// Screen recording doesn't work on emulators below this API level.
/// <https://issuetracker.google.com/issues/36982354>
const MIN_EMULATOR_API_FOR_SCREENRECORD: u32 = 23;

lazy_static! {
    static ref SCREEN_STATE: Regex = Regex::new(r"(?m)^\s*mScreenState=(\w*)$").unwrap();
    static ref TOP_ACTIVITY: Regex = Regex::new(r"ActivityRecord\{.* (\S+)/(\S+)").unwrap();
    static ref URL_SCHEME: Regex = Regex::new(r"^[A-Za-z][A-Za-z0-9+.-]*:").unwrap();
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ScreenSwitch {
    On,
    Off,
    Toggle,
}

async fn toggle_screen(device: &Device) -> Result<()> {
    let output = device.shell(TOGGLE_SCREEN_CMD).await?;
    if !output.success() {
        return Err(CliError::failed(format!(
            "Something gone wrong on screen control operation. Error: {}",
            output.stderr.trim()
        )));
    }
    Ok(())
}

fn screen_is_on(dumpsys_display: &str) -> Option<bool> {
    match &SCREEN_STATE.captures(dumpsys_display)?[1] {
        "ON" => Some(true),
        "OFF" | "DOZE" => Some(false),
        _ => None,
    }
}

pub async fn switch_screen(device: &Device, switch: ScreenSwitch) -> Result<()> {
    let want_on = match switch {
        ScreenSwitch::Toggle => return toggle_screen(device).await,
        ScreenSwitch::On => true,
        ScreenSwitch::Off => false,
    };
    let output = device.shell("dumpsys display").await?;
    if !output.success() {
        return Err(CliError::failed(format!(
            "Something gone wrong on screen control operation. Error: {}",
            output.stderr.trim()
        )));
    }
    match screen_is_on(output.text()) {
        Some(is_on) if is_on != want_on => toggle_screen(device).await,
        Some(_) => {
            debug!("Screen is already {}", if want_on { "on" } else { "off" });
            Ok(())
        }
        None => Err(CliError::failed("Unable to get the screen state")),
    }
}

/// Application and activity of the first activity record, with `.Short` names expanded.
fn parse_top_activity(dumpsys_window: &str) -> Option<(String, String)> {
    dumpsys_window.lines().find_map(|line| {
        let cap = TOP_ACTIVITY.captures(line.trim())?;
        let app = cap[1].to_owned();
        let activity = match &cap[2] {
            short if short.starts_with('.') => format!("{app}{short}"),
            full => full.to_owned(),
        };
        Some((app, activity))
    })
}

pub async fn top_activity(device: &Device) -> Result<Option<(String, String)>> {
    let output = device.shell("dumpsys window windows").await?;
    if !output.success() && output.stdout.is_none() {
        return Err(CliError::failed(
            "Device returned no response, is it still connected?",
        ));
    }
    Ok(parse_top_activity(output.text()))
}

pub async fn print_top_activity(device: &Device) -> Result<()> {
    match top_activity(device).await? {
        Some((app, activity)) => {
            print_message(&format!("Application name: {app}"));
            print_message(&format!("Activity name: {activity}"));
        }
        None => print_error("Unable to extract activity name"),
    }
    Ok(())
}

/// Pulls `device_path` to `local_path` and deletes it from the device, even if the pull failed.
async fn pull_and_delete(device: &Device, device_path: &str, local_path: &str) -> Result<bool> {
    let pulled = device
        .host(format!("pull {device_path} \"{local_path}\""))
        .await?;
    debug!("Deleting file {device_path}");
    device.shell(format!("rm {device_path}")).await?;
    Ok(pulled.success())
}

pub async fn dump_ui(device: &Device, xml_file: &str) -> Result<()> {
    let tmp_file = create_tmp_file(device, "dump-ui", "xml").await?;
    let cmd = format!("uiautomator dump {tmp_file}");
    debug!("Writing UI to {tmp_file}");
    let output = device.shell(&cmd).await?;
    if !output.success() {
        return Err(CliError::failed(format!(
            "Failed to execute \"{cmd}\", stderr: \"{}\"",
            output.stderr.trim()
        )));
    }
    if !pull_and_delete(device, &tmp_file, xml_file).await? {
        return Err(CliError::failed(format!("Failed to fetch file {tmp_file}")));
    }
    print_message(&format!(
        "XML UI dumped to {xml_file}, you might want to format it using \"xmllint --format {xml_file}\""
    ));
    Ok(())
}

pub async fn screenshot(device: &Device, png_file: &str) -> Result<()> {
    let tmp_file = create_tmp_file(device, "screenshot", "png").await?;
    let output = device.shell(format!("screencap -p {tmp_file}")).await?;
    if !output.success() {
        return Err(CliError::failed(format!(
            "Failed to capture the screenshot: (stdout: {}, stderr: {})",
            output.text(),
            output.stderr.trim()
        )));
    }
    if !pull_and_delete(device, &tmp_file, png_file).await? {
        return Err(CliError::failed(format!("Failed to fetch file {tmp_file}")));
    }
    Ok(())
}

/// Records until the user presses Ctrl+C or the recording hits its time limit, then saves it.
pub async fn screenrecord(device: &Device, mp4_file: &str) -> Result<()> {
    device.require_api(MIN_API_FOR_SETTINGS).await?;
    if device.api_version().await? < MIN_EMULATOR_API_FOR_SCREENRECORD
        && device.is_emulator().await?
    {
        return Err(CliError::failed(
            "screenrecord is not supported on emulator below API 23\n\
             Source: https://issuetracker.google.com/issues/36982354",
        ));
    }

    let tmp_file = create_tmp_file(device, "screenrecord", "mp4").await?;
    print_message("Recording video, press Ctrl+C to end...");
    let recording = device
        .execute_until_interrupted(AdbCommand::shell(format!("screenrecord --verbose {tmp_file}")))
        .await?;
    if recording.is_none() {
        print_message("Finishing...");
    }
    // Give the device time to finalize the file.
    tokio::time::sleep(Duration::from_secs(1)).await;
    print_message(&format!("Saving recording to {mp4_file}"));
    if !pull_and_delete(device, &tmp_file, mp4_file).await? {
        return Err(CliError::failed(format!("Failed to fetch file {tmp_file}")));
    }
    Ok(())
}

/// Spaces are sent as `%s`, which Android turns back into spaces.
pub async fn input_text(device: &Device, text: &str) -> Result<()> {
    let output = device
        .shell(format!("input text {}", text.replace(' ', "%s")))
        .await?;
    if !output.success() {
        return Err(CliError::failed(format!("Failed to input text \"{text}\"")));
    }
    Ok(())
}

pub async fn press_back(device: &Device) -> Result<()> {
    let output = device
        .shell(format!("input keyevent {KEYCODE_BACK}"))
        .await?;
    if !output.success() {
        return Err(CliError::failed("Failed to press back"));
    }
    Ok(())
}

/// No URL encoding is done, the URL only gets a default `http://` scheme.
fn with_default_scheme(url: &str) -> String {
    if URL_SCHEME.is_match(url) {
        url.to_owned()
    } else {
        format!("http://{}", url.trim_start_matches("//"))
    }
}

pub async fn open_url(device: &Device, url: &str) -> Result<()> {
    let url = with_default_scheme(url);
    let output = device
        .shell(format!("am start -a android.intent.action.VIEW -d {url}"))
        .await?;
    if !output.success() {
        return Err(CliError::failed(format!("Failed to open url \"{url}\"")));
    }
    Ok(())
}
