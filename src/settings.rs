//! Developer options and system toggles.
//!
//! Most of these are one `settings put` or `setprop` away. Where the change can be observed,
//! the state is read before and after and the difference is printed.

use clap::ValueEnum;
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;

use crate::{
    adb::CommandOutput,
    device::{Device, MIN_API_FOR_SETTINGS},
    error::{CliError, Result},
    output::print_error,
    state::{report_state_change, State, SETTLE_DELAY},
};

const MIN_API_FOR_DOZE: u32 = 23;
const MIN_API_FOR_DARK_MODE: u32 = 29;
const MIN_API_FOR_LOCATION: u32 = 29;
const MIN_API_FOR_DEUT_OVERDRAW: u32 = 19;

const BATTERY_UNPLUG_CMD: &str = "dumpsys battery unplug";
/// Most likely Android 6.0 onwards only.
const BATTERY_DISCHARGING_CMD: &str = "dumpsys battery set status 3";
const BATTERY_RESET_CMD: &str = "dumpsys battery reset";

lazy_static! {
    static ref DATA_CONNECTION_STATE: Regex = Regex::new(r"mDataConnectionState=(\d+)").unwrap();
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum GfxMode {
    On,
    Off,
    Lines,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OverdrawMode {
    On,
    Off,
    /// Deuteranomaly-friendly colors
    Deut,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Rotation {
    Portrait,
    Landscape,
    /// Counter-clockwise from the current rotation
    Left,
    /// Clockwise from the current rotation
    Right,
}

fn setting_value(output: &CommandOutput) -> Option<&str> {
    output.stdout.as_deref().map(str::trim)
}

fn setting_int(output: &CommandOutput) -> Option<i64> {
    setting_value(output).and_then(|v| v.parse().ok())
}

pub async fn gfx(device: &Device, mode: GfxMode) -> Result<()> {
    let cmd = match mode {
        GfxMode::On => "setprop debug.hwui.profile visual_bars",
        GfxMode::Off => "setprop debug.hwui.profile false",
        GfxMode::Lines => "setprop debug.hwui.profile visual_lines",
    };
    device.shell_and_poke(cmd).await?;
    Ok(())
}

pub async fn overdraw(device: &Device, mode: OverdrawMode) -> Result<()> {
    let version = device.api_version().await?;
    let cmd = if version < MIN_API_FOR_DEUT_OVERDRAW {
        match mode {
            OverdrawMode::On => "setprop debug.hwui.show_overdraw true",
            OverdrawMode::Off => "setprop debug.hwui.show_overdraw false",
            OverdrawMode::Deut => {
                return Err(CliError::ApiTooLow {
                    required: MIN_API_FOR_DEUT_OVERDRAW,
                    actual: version,
                })
            }
        }
    } else {
        match mode {
            OverdrawMode::On => "setprop debug.hwui.overdraw show",
            OverdrawMode::Off => "setprop debug.hwui.overdraw false",
            OverdrawMode::Deut => "setprop debug.hwui.overdraw show_deuteranomaly",
        }
    };
    device.shell_and_poke(cmd).await?;
    Ok(())
}

pub async fn layout(device: &Device, on: bool) -> Result<()> {
    device
        .shell_and_poke(&format!("setprop debug.layout {on}"))
        .await?;
    Ok(())
}

pub async fn rotate(device: &Device, rotation: Rotation) -> Result<()> {
    device
        .settings("put system accelerometer_rotation 0")
        .await?;
    let new_rotation = match rotation {
        Rotation::Portrait => 0,
        Rotation::Landscape => 1,
        Rotation::Left => (current_rotation(device).await? + 1) % 4,
        Rotation::Right => (current_rotation(device).await? + 3) % 4,
    };
    device
        .settings(&format!("put system user_rotation {new_rotation}"))
        .await?;
    Ok(())
}

async fn current_rotation(device: &Device) -> Result<u32> {
    let output = device.settings("get system user_rotation").await?;
    let rotation = match setting_value(&output) {
        // Upright
        None | Some("null") => 0,
        Some(value) => value.parse::<u32>().unwrap_or_else(|e| {
            print_error(&format!("Failed to get direction, error: \"{e}\""));
            0
        }),
    };
    debug!("Current rotation: {rotation}");
    Ok(rotation)
}

pub async fn airplane(device: &Device, on: bool) -> Result<()> {
    let state = u8::from(on);
    let su = device.shell("which su").await?;
    if su.success() && su.stdout.is_some() {
        device
            .settings(&format!("put global airplane_mode_on {state}"))
            .await?;
        // Protected broadcast, needs root.
        let broadcast = device
            .shell("su root am broadcast -a android.intent.action.AIRPLANE_MODE")
            .await?;
        if !broadcast.success() {
            return Err(CliError::failed("Failed to change airplane mode"));
        }
        return Ok(());
    }

    // Without root, airplane mode is emulated by turning off Wi-Fi and mobile data, remembering
    // their previous state in two extra global settings.
    let wifi_state = device.settings("get global wifi_on").await?;
    let data_state = device.settings("get global mobile_data").await?;
    if !wifi_state.success() {
        print_error("Failed to get wifi state");
        return Ok(());
    }
    if !data_state.success() {
        print_error("Failed to get mobile-data state");
        return Ok(());
    }

    if on {
        let saved_wifi = device
            .settings(&format!("put global adbe_wifi {}", wifi_state.text()))
            .await?;
        let saved_data = device
            .settings(&format!("put global adbe_data {}", data_state.text()))
            .await?;
        let airplane = device.settings("put global airplane_mode_on 1").await?;
        if !saved_wifi.success() || !saved_data.success() || !airplane.success() {
            print_error("Failed to put \"Global\" settings states. Proceeding anyway ...");
        }
        mobile_data(device, false).await?;
        wifi(device, false).await?;
    } else {
        let last_wifi = device.settings("get global adbe_wifi").await?;
        let last_data = device.settings("get global adbe_data").await?;
        let airplane = device.settings("put global airplane_mode_on 0").await?;
        if !last_wifi.success() || !last_data.success() {
            print_error("Failed to get \"Global\" settings states. Enabling mobile-data and Wifi ...");
        }
        if !airplane.success() {
            print_error("Failed to change airplane mode.");
        }
        mobile_data(device, setting_value(&last_data).map_or(true, |v| v == "1")).await?;
        wifi(device, setting_value(&last_wifi).map_or(true, |v| v == "1")).await?;
    }
    Ok(())
}

async fn battery_saver_state(device: &Device) -> Result<State> {
    device.require_api(MIN_API_FOR_SETTINGS).await?;
    let output = device.settings("get global low_power").await?;
    if !output.success() {
        print_error("Failed to get battery saver state");
        return Ok(State::Unknown);
    }
    Ok(match setting_value(&output) {
        None | Some("null") => State::Off,
        Some(value) => match value.parse::<i64>() {
            Ok(state) => State::from_bool(state != 0),
            Err(_) => {
                print_error(&format!("Unable to get int value from \"{value}\""));
                State::Unknown
            }
        },
    })
}

pub async fn battery_saver(device: &Device, on: bool) -> Result<()> {
    device.require_api(MIN_API_FOR_SETTINGS).await?;
    report_state_change(
        "Battery saver",
        SETTLE_DELAY,
        move || battery_saver_state(device),
        move || async move {
            if on {
                if !device.shell(BATTERY_UNPLUG_CMD).await?.success() {
                    return Err(CliError::failed("Failed to unplug battery"));
                }
                if !device.shell(BATTERY_DISCHARGING_CMD).await?.success() {
                    return Err(CliError::failed("Failed to put battery in discharge mode"));
                }
            }
            let output = device
                .settings(&format!("put global low_power {}", u8::from(on)))
                .await?;
            if !output.success() {
                return Err(CliError::failed("Failed to modify battery saver mode"));
            }
            Ok(())
        },
    )
    .await
}

/// Validates `level` before anything is sent to the device.
pub async fn battery_level(device: &Device, level: i64) -> Result<()> {
    if !(0..=100).contains(&level) {
        return Err(CliError::InvalidArgument(format!(
            "Battery percentage {level} is outside the valid range of 0 to 100"
        )));
    }
    device.require_api(MIN_API_FOR_SETTINGS).await?;
    device.shell(BATTERY_UNPLUG_CMD).await?;
    device.shell(BATTERY_DISCHARGING_CMD).await?;
    device
        .shell(format!("dumpsys battery set level {level}"))
        .await?;
    Ok(())
}

pub async fn battery_reset(device: &Device) -> Result<()> {
    // These fail silently on API 16.
    device.require_api(MIN_API_FOR_SETTINGS).await?;
    device.shell(BATTERY_RESET_CMD).await?;
    Ok(())
}

pub async fn doze(device: &Device, on: bool) -> Result<()> {
    device.require_api(MIN_API_FOR_DOZE).await?;
    let cmds: &[&str] = if on {
        &[
            BATTERY_UNPLUG_CMD,
            BATTERY_DISCHARGING_CMD,
            "dumpsys deviceidle enable",
            "dumpsys deviceidle force-idle",
        ]
    } else {
        &[
            BATTERY_RESET_CMD,
            "dumpsys deviceidle enable",
            "dumpsys deviceidle unforce",
        ]
    };
    for cmd in cmds {
        device.shell(*cmd).await?;
    }
    Ok(())
}

async fn mobile_data_state(device: &Device) -> Result<State> {
    let output = device.shell("dumpsys telephony.registry").await?;
    if !output.success() || output.stdout.is_none() {
        print_error("Failed to get mobile data setting");
        return Ok(State::Unknown);
    }
    match DATA_CONNECTION_STATE.captures(output.text()) {
        Some(cap) => Ok(State::from_bool(&cap[1] != "0")),
        None => {
            print_error("Failed to get mobile data setting from dumpsys output");
            Ok(State::Unknown)
        }
    }
}

pub async fn mobile_data(device: &Device, on: bool) -> Result<()> {
    report_state_change(
        "Mobile data",
        SETTLE_DELAY,
        move || mobile_data_state(device),
        move || async move {
            let cmd = if on { "svc data enable" } else { "svc data disable" };
            if !device.shell(cmd).await?.success() {
                return Err(CliError::failed("Failed to change mobile data setting"));
            }
            Ok(())
        },
    )
    .await
}

async fn wifi_state(device: &Device) -> Result<State> {
    let output = device.settings("get global wifi_on").await?;
    if !output.success() {
        print_error("Failed to get global Wi-Fi setting");
        return Ok(State::Unknown);
    }
    Ok(match setting_int(&output) {
        Some(value) => State::from_bool(value == 1),
        None => State::Unknown,
    })
}

pub async fn wifi(device: &Device, on: bool) -> Result<()> {
    report_state_change(
        "Wi-Fi",
        SETTLE_DELAY,
        move || wifi_state(device),
        move || async move {
            let cmd = if on { "svc wifi enable" } else { "svc wifi disable" };
            if !device.shell(cmd).await?.success() {
                return Err(CliError::failed("Failed to change Wi-Fi setting"));
            }
            Ok(())
        },
    )
    .await
}

async fn mobile_data_saver_state(device: &Device) -> Result<State> {
    let output = device.shell("cmd netpolicy get restrict-background").await?;
    if !output.success() {
        print_error("Failed to get mobile data saver mode setting");
        return Ok(State::Unknown);
    }
    Ok(State::from_bool(output.text().contains("enabled")))
}

/// <https://developer.android.com/training/basics/network-ops/data-saver.html>
pub async fn mobile_data_saver(device: &Device, on: bool) -> Result<()> {
    report_state_change(
        "Mobile data saver",
        SETTLE_DELAY,
        move || mobile_data_saver_state(device),
        move || async move {
            let cmd = format!("cmd netpolicy set restrict-background {on}");
            if !device.shell(cmd).await?.success() {
                return Err(CliError::failed("Failed to modify data saver mode setting"));
            }
            Ok(())
        },
    )
    .await
}

pub async fn rtl(device: &Device, on: bool) -> Result<()> {
    device
        .settings_and_poke(&format!("put global debug.force_rtl {}", u8::from(on)))
        .await?;
    Ok(())
}

pub async fn animations(device: &Device, on: bool) -> Result<()> {
    let value = u8::from(on);
    for scale in [
        "window_animation_scale",
        "transition_animation_scale",
        "animator_duration_scale",
    ] {
        device
            .settings(&format!("put global {scale} {value}"))
            .await?;
    }
    Ok(())
}

async fn show_taps_state(device: &Device) -> Result<State> {
    let output = device.settings("get system show_touches").await?;
    if !output.success() {
        print_error("Failed to get current state of \"show user taps\" setting");
        return Ok(State::Unknown);
    }
    Ok(State::from_bool(setting_int(&output) == Some(1)))
}

pub async fn show_taps(device: &Device, on: bool) -> Result<()> {
    report_state_change(
        "Show user taps",
        SETTLE_DELAY,
        move || show_taps_state(device),
        move || async move {
            device
                .settings(&format!("put system show_touches {}", u8::from(on)))
                .await?;
            Ok(())
        },
    )
    .await
}

async fn stay_awake_while_charging_state(device: &Device) -> Result<State> {
    let output = device.settings("get global stay_on_while_plugged_in").await?;
    if !output.success() {
        print_error("Failed to get \"stay awake while plugged in\" setting");
        return Ok(State::Unknown);
    }
    Ok(match setting_int(&output) {
        Some(0) => State::Off,
        Some(STAY_ON_ALL_CHARGERS) => State::On,
        Some(_) => State::PartiallyOn,
        None => State::Unknown,
    })
}

/// USB (1) + AC (2) + wireless (4) charging.
const STAY_ON_ALL_CHARGERS: i64 = 7;

pub async fn stay_awake_while_charging(device: &Device, on: bool) -> Result<()> {
    report_state_change(
        "Stay awake while charging",
        SETTLE_DELAY,
        move || stay_awake_while_charging_state(device),
        move || async move {
            let value = if on { STAY_ON_ALL_CHARGERS } else { 0 };
            device
                .settings_and_poke(&format!("put global stay_on_while_plugged_in {value}"))
                .await?;
            Ok(())
        },
    )
    .await
}

async fn dont_keep_activities_state(device: &Device) -> Result<State> {
    let output = device.settings("get global always_finish_activities").await?;
    if !output.success() {
        print_error("Failed to get don't keep activities in the background setting");
        return Ok(State::Unknown);
    }
    Ok(match setting_value(&output) {
        None | Some("null") | Some("false") => State::Off,
        Some("true") => State::On,
        Some(value) => match value.parse::<i64>() {
            Ok(v) => State::from_bool(v != 0),
            Err(_) => State::Unknown,
        },
    })
}

pub async fn dont_keep_activities(device: &Device, on: bool) -> Result<()> {
    report_state_change(
        "Don't keep activities",
        SETTLE_DELAY,
        move || dont_keep_activities_state(device),
        move || async move {
            // Up to API 25 the value is true/false, 1/0 after that.
            let value = if device.api_version().await? <= 25 {
                on.to_string()
            } else {
                u8::from(on).to_string()
            };
            device
                .settings(&format!("put global always_finish_activities {value}"))
                .await?;
            device
                .shell_and_poke(&format!("service call activity 43 i32 {}", u8::from(on)))
                .await?;
            Ok(())
        },
    )
    .await
}

pub async fn dark_mode(device: &Device, on: bool) -> Result<()> {
    device.require_api(MIN_API_FOR_DARK_MODE).await?;
    let cmd = if on {
        "cmd uimode night yes"
    } else {
        "cmd uimode night no"
    };
    device.shell(cmd).await?;
    Ok(())
}

pub async fn location(device: &Device, on: bool) -> Result<()> {
    device.require_api(MIN_API_FOR_LOCATION).await?;
    let mode = if on { 3 } else { 0 };
    device
        .settings(&format!("put secure location_mode {mode}"))
        .await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use super::*;
    use crate::device::testing::{ok, scripted};

    #[tokio::test]
    async fn battery_level_out_of_range_issues_no_command() {
        let (device, runner) = scripted(|_| ok("30"));
        for level in [-1, 101, 150] {
            let err = battery_level(&device, level).await.unwrap_err();
            assert!(matches!(err, CliError::InvalidArgument(_)));
            assert!(err.to_string().contains("outside the valid range of 0 to 100"));
        }
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn battery_level_unplugs_first() {
        let (device, runner) = scripted(|cmd| match cmd {
            "shell getprop ro.build.version.sdk" => ok("30"),
            _ => ok(""),
        });
        battery_level(&device, 10).await.unwrap();
        assert_eq!(
            vec![
                "shell getprop ro.build.version.sdk",
                "shell dumpsys battery unplug",
                "shell dumpsys battery set status 3",
                "shell dumpsys battery set level 10",
            ],
            runner.calls()
        );
    }

    #[tokio::test]
    async fn rotate_left_wraps_around() {
        let (device, runner) = scripted(|cmd| match cmd {
            "shell getprop ro.build.version.sdk" => ok("28"),
            "shell settings get system user_rotation" => ok("3"),
            _ => ok(""),
        });
        rotate(&device, Rotation::Left).await.unwrap();
        assert!(runner
            .calls()
            .contains(&"shell settings put system user_rotation 0".to_owned()));
    }

    #[tokio::test]
    async fn rotate_right_from_unset() {
        let (device, runner) = scripted(|cmd| match cmd {
            "shell getprop ro.build.version.sdk" => ok("28"),
            "shell settings get system user_rotation" => ok("null"),
            _ => ok(""),
        });
        rotate(&device, Rotation::Right).await.unwrap();
        assert!(runner
            .calls()
            .contains(&"shell settings put system user_rotation 3".to_owned()));
    }

    #[tokio::test]
    async fn deut_overdraw_needs_api_19() {
        let (device, runner) = scripted(|_| ok("18"));
        assert!(matches!(
            overdraw(&device, OverdrawMode::Deut).await,
            Err(CliError::ApiTooLow { required: 19, actual: 18 })
        ));
        overdraw(&device, OverdrawMode::On).await.unwrap();
        assert!(runner
            .calls()
            .contains(&"shell setprop debug.hwui.show_overdraw true".to_owned()));
        assert_eq!(
            Some(&"shell service call activity 1599295570".to_owned()),
            runner.calls().last()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn wifi_reports_state_change() {
        let enabled = Arc::new(AtomicBool::new(false));
        let state = enabled.clone();
        let (device, runner) = scripted(move |cmd| match cmd {
            "shell getprop ro.build.version.sdk" => ok("30"),
            "shell settings get global wifi_on" => {
                ok(if state.load(Ordering::SeqCst) { "1" } else { "0" })
            }
            "shell svc wifi enable" => {
                state.store(true, Ordering::SeqCst);
                ok("")
            }
            _ => ok(""),
        });
        wifi(&device, true).await.unwrap();
        assert!(enabled.load(Ordering::SeqCst));
        let calls = runner.calls();
        let enable_at = calls.iter().position(|c| c == "shell svc wifi enable").unwrap();
        assert_eq!("shell settings get global wifi_on", calls[enable_at - 1]);
        assert_eq!("shell settings get global wifi_on", calls[enable_at + 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn stay_awake_partial_state() {
        let (device, _) = scripted(|cmd| match cmd {
            "shell getprop ro.build.version.sdk" => ok("30"),
            "shell settings get global stay_on_while_plugged_in" => ok("3"),
            _ => ok(""),
        });
        assert_eq!(
            State::PartiallyOn,
            stay_awake_while_charging_state(&device).await.unwrap()
        );
    }

    #[tokio::test]
    async fn mobile_data_state_from_registry() {
        let (device, _) = scripted(|cmd| match cmd {
            "shell dumpsys telephony.registry" => ok("  mServiceState=0\n  mDataConnectionState=2\n"),
            _ => ok(""),
        });
        assert_eq!(State::On, mobile_data_state(&device).await.unwrap());
    }

    #[tokio::test]
    async fn dark_mode_needs_api_29() {
        let (device, runner) = scripted(|_| ok("28"));
        assert!(dark_mode(&device, true).await.is_err());
        assert_eq!(1, runner.calls().len());
    }
}
