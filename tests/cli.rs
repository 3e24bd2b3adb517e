#![cfg(unix)]

use assert_cmd::prelude::*;
use indoc::indoc;
use predicates::prelude::*;
use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    process::Command,
    sync::OnceLock,
};
use tempfile::TempDir;

/// A stand-in for adb. `FAKE_ADB_SCENARIO` picks the device setup, and every invocation is
/// appended to `FAKE_ADB_LOG`.
const FAKE_ADB: &str = indoc! {r#"
    #!/bin/sh
    echo "$*" >> "$FAKE_ADB_LOG"
    case "$FAKE_ADB_SCENARIO:$*" in
      multiple-devices:*)
        echo "error: more than one device/emulator" >&2
        exit 1 ;;
      no-devices:"devices -l")
        printf 'List of devices attached\n\n' ;;
      one-device:"devices -l")
        printf 'List of devices attached\nemulator-5554\tdevice product:sdk_gphone64 model:Pixel_7 transport_id:1\n\n' ;;
      *"getprop ro.product.manufacturer") echo Google ;;
      *"getprop ro.product.model") echo "Pixel 7" ;;
      *"getprop ro.build.version.release") echo 13 ;;
      *"getprop ro.build.version.sdk") echo 33 ;;
      *"getprop ro.product.cpu.abi") echo x86_64 ;;
      *"settings get system device_name") echo "Pixel 7" ;;
      *"shell pm path com.example.app") echo "package:/data/app/com.example.app/base.apk" ;;
      *"shell pm path "*) exit 1 ;;
      *"shell pm list permissions -g")
        printf 'All Permissions:\n\ngroup:android.permission-group.STORAGE\n  permission:android.permission.READ_EXTERNAL_STORAGE\n\nungrouped:\n  permission:android.permission.INTERNET\n' ;;
      *"shell dumpsys package com.example.app")
        printf 'Package [com.example.app] (f00ba4):\nrequested permissions:\n  android.permission.READ_EXTERNAL_STORAGE\ninstall permissions:\nruntime permissions:\n  android.permission.READ_EXTERNAL_STORAGE: granted=false\n' ;;
      *) ;;
    esac
"#};

/// Written once, so no test can exec the script while another one still has it open for writing.
fn fake_adb() -> &'static Path {
    static FAKE_ADB_PATH: OnceLock<PathBuf> = OnceLock::new();
    FAKE_ADB_PATH.get_or_init(|| {
        let dir = tempfile::tempdir().unwrap().into_path();
        let path = dir.join("adb");
        fs::write(&path, FAKE_ADB).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    })
}

struct FakeDevice {
    log_dir: TempDir,
}

impl FakeDevice {
    fn new() -> Self {
        Self {
            log_dir: tempfile::tempdir().unwrap(),
        }
    }

    fn log_path(&self) -> PathBuf {
        self.log_dir.path().join("calls.log")
    }

    fn adbe(&self, scenario: &str) -> Command {
        let mut cmd = Command::cargo_bin("adbe").unwrap();
        cmd.arg("--adb-path")
            .arg(fake_adb())
            .env("FAKE_ADB_SCENARIO", scenario)
            .env("FAKE_ADB_LOG", self.log_path())
            .env_remove("ADBE_EXIT_CODE_API_FLOOR")
            .env_remove("ADBE_SEQUENTIAL");
        cmd
    }

    fn calls(&self) -> Vec<String> {
        fs::read_to_string(self.log_path())
            .unwrap_or_default()
            .lines()
            .map(str::to_owned)
            .collect()
    }
}

#[test]
fn conflicting_device_selection() {
    let fake = FakeDevice::new();
    fake.adbe("one-device")
        .args(["-e", "-d", "devices"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains(
            "Only one of -e, -d, or -s can be provided",
        ));
    assert!(fake.calls().is_empty());
}

#[test]
fn battery_level_out_of_range() {
    let fake = FakeDevice::new();
    fake.adbe("one-device")
        .args(["battery", "level", "150"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains(
            "Battery percentage 150 is outside the valid range of 0 to 100",
        ));
    assert!(fake.calls().is_empty());
}

#[test]
fn no_devices() {
    let fake = FakeDevice::new();
    fake.adbe("no-devices")
        .arg("devices")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("No attached Android device found"));
}

#[test]
fn one_device() {
    let fake = FakeDevice::new();
    fake.adbe("one-device")
        .arg("devices")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("Serial ID: emulator-5554")
                .and(predicate::str::contains("Manufacturer: Google"))
                .and(predicate::str::contains("Model: Pixel 7 (Pixel 7)"))
                .and(predicate::str::contains("Release: 13"))
                .and(predicate::str::contains("SDK version: 33"))
                .and(predicate::str::contains("CPU: x86_64")),
        );
    assert!(fake
        .calls()
        .contains(&"-s emulator-5554 shell getprop ro.build.version.sdk".to_owned()));
}

#[test]
fn more_than_one_device() {
    let fake = FakeDevice::new();
    fake.adbe("multiple-devices")
        .arg("top-activity")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("-s parameter"));
}

#[test]
fn grant_storage_permissions() {
    let fake = FakeDevice::new();
    fake.adbe("permissions")
        .args(["permissions", "grant", "com.example.app", "storage"])
        .assert()
        .success()
        .stdout(
            predicate::str::contains(
                "grant android.permission.READ_EXTERNAL_STORAGE permission to com.example.app",
            )
            .and(predicate::str::contains(
                "Permission android.permission.WRITE_EXTERNAL_STORAGE is not requested",
            )),
        );
    let calls = fake.calls();
    assert!(calls.contains(&"shell pm path com.example.app".to_owned()));
    assert!(calls.contains(
        &"shell pm grant com.example.app android.permission.READ_EXTERNAL_STORAGE".to_owned()
    ));
    assert!(!calls.iter().any(|c| c.contains("WRITE_EXTERNAL_STORAGE")));
}

#[test]
fn missing_package() {
    let fake = FakeDevice::new();
    fake.adbe("permissions")
        .args(["app", "info", "com.missing"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Package com.missing does not exist"));
    assert_eq!(vec!["shell pm path com.missing"], fake.calls());
}

#[test]
fn unknown_command() {
    let fake = FakeDevice::new();
    fake.adbe("one-device")
        .args(["frobnicate", "now"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Not implemented: \""));
    assert!(fake.calls().is_empty());
}
