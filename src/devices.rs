//! Listing attached devices and switching them to wireless debugging.

use lazy_static::lazy_static;
use log::debug;
use regex::Regex;

use crate::{
    adb::AdbCommand,
    device::Device,
    error::{CliError, Result},
    output::{print_error, print_message},
};

lazy_static! {
    static ref DEVICE_LINE: Regex = Regex::new(r"^(\S+)\s+(\S+)(.*)$").unwrap();
    static ref MODEL: Regex = Regex::new(r"model:(\S+)").unwrap();
    static ref WLAN_ADDRESS: Regex =
        Regex::new(r"(?m)inet (\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}).*wlan0$").unwrap();
    static ref IP_SERIAL: Regex = Regex::new(r"(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}:\d{1,5})").unwrap();
}

const WIRELESS_DEBUGGING_PORT: u16 = 5555;

/// A device as listed by `adb devices -l`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdbDevice {
    /// The serial number of the device, used with `-s` to direct commands to it.
    pub serial: String,
    /// Connection state, e.g. `device`, `offline` or `unauthorized`.
    pub state: String,
    /// The `model:` attribute, when adb reports one. (e.g. Pixel_7)
    pub model: Option<String>,
    /// Everything after the state, as printed by adb.
    pub details: String,
}

impl AdbDevice {
    pub fn is_authorized(&self) -> bool {
        self.state != "unauthorized"
    }
}

fn parse_adb_devices<'a>(adb_device_output: impl Iterator<Item = &'a str>) -> Vec<AdbDevice> {
    adb_device_output
        .map(str::trim)
        .filter(|line| !line.starts_with("List of devices") && !line.starts_with('*'))
        .filter_map(|line| {
            let cap = DEVICE_LINE.captures(line)?;
            Some(AdbDevice {
                serial: cap[1].to_owned(),
                state: cap[2].to_owned(),
                model: MODEL.captures(&cap[3]).map(|m| m[1].to_owned()),
                details: cap[3].trim().to_owned(),
            })
        })
        .collect()
}

/// Queries `adb devices -l`.
pub async fn adb_devices(device: &Device) -> Result<Vec<AdbDevice>> {
    let cmd = "devices -l";
    let output = device.host(cmd).await?;
    if !output.success() {
        return Err(CliError::failed(format!(
            "Failed to execute command {cmd}, error: {}",
            output.stderr.trim()
        )));
    }
    Ok(parse_adb_devices(output.text().lines()))
}

/// Serials of the devices that can take commands. Unauthorized devices are reported and skipped.
pub async fn device_serials(device: &Device) -> Result<Vec<String>> {
    let mut serials = Vec::new();
    for d in adb_devices(device).await? {
        debug!(
            "Found {} ({}) in state {}",
            d.serial,
            d.model.as_deref().unwrap_or("unknown model"),
            d.state
        );
        if d.is_authorized() {
            serials.push(d.serial);
        } else {
            print_error(&format!(
                "Unlock Device \"{}\" and give USB debugging access to this PC/Laptop by \
                 unlocking and reconnecting the device. More info about this device: \"{} {}\"\n",
                d.serial, d.state, d.details
            ));
        }
    }
    Ok(serials)
}

pub async fn list_devices(device: &Device) -> Result<()> {
    let serials = device_serials(device).await?;
    if serials.is_empty() {
        return Err(CliError::failed("No attached Android device found"));
    }
    for serial in serials {
        print_message(&device_info(device, &serial).await?);
    }
    Ok(())
}

fn is_unset(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v == "null")
}

async fn device_info(device: &Device, serial: &str) -> Result<String> {
    let serial_arg = Some(serial);
    let manufacturer = device.getprop("ro.product.manufacturer", serial_arg).await?;
    let model = device.getprop("ro.product.model", serial_arg).await?;
    let release = device.getprop("ro.build.version.release", serial_arg).await?;
    let sdk = device.getprop("ro.build.version.sdk", serial_arg).await?;
    let abi = device.getprop("ro.product.cpu.abi", serial_arg).await?;
    let api_version: u32 = sdk.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0);

    // Works on API 19 Moto E.
    let mut display_name = device.getprop("ro.product.display", serial_arg).await?;
    // Undocumented, works on API 19 Galaxy Grand Prime.
    if is_unset(&display_name) && api_version >= 19 {
        display_name = device
            .execute(AdbCommand::shell("settings get system device_name").on_serial(serial_arg))
            .await?
            .stdout;
    }
    // Documented for API 25 and above.
    if is_unset(&display_name) && api_version >= 25 {
        display_name = device
            .execute(AdbCommand::shell("settings get global device_name").on_serial(serial_arg))
            .await?
            .stdout;
    }

    let show = |value: &Option<String>| value.clone().unwrap_or_else(|| "unknown".to_owned());
    Ok(format!(
        "Serial ID: {serial}\nManufacturer: {}\nModel: {} ({})\nRelease: {}\nSDK version: {}\nCPU: {}\n",
        show(&manufacturer),
        show(&model),
        show(&display_name),
        show(&release),
        show(&sdk),
        show(&abi),
    ))
}

pub async fn enable_wireless_debugging(device: &Device) -> Result<()> {
    let output = device.shell("ip address").await?;
    if !output.success() {
        return Err(CliError::failed(format!(
            "Failed to switch device to wireless debug mode, stderr: {}",
            output.stderr.trim()
        )));
    }
    let ip = WLAN_ADDRESS
        .captures(output.text())
        .map(|cap| cap[1].to_owned())
        .ok_or_else(|| CliError::failed("Failed to switch device to wireless debug mode"))?;

    let output = device.host(format!("tcpip {WIRELESS_DEBUGGING_PORT}")).await?;
    if !output.success() {
        return Err(CliError::failed(format!(
            "Failed to switch device {ip} to wireless debug mode, stderr: {}",
            output.stderr.trim()
        )));
    }
    let output = device.host(format!("connect {ip}")).await?;
    if !output.success() {
        return Err(CliError::failed(format!(
            "Cannot enable wireless debugging. Error: {}",
            output.stderr.trim()
        )));
    }
    print_message(&format!(
        "Connected via IP now you can disconnect the cable\nIP: {ip}"
    ));
    Ok(())
}

pub async fn disable_wireless_debugging(device: &Device) -> Result<()> {
    let serials = device_serials(device).await?;
    if serials.is_empty() {
        return Err(CliError::failed("No connected device found"));
    }

    let mut addresses = Vec::new();
    for serial in &serials {
        let mut ips = IP_SERIAL.find_iter(serial).map(|m| m.as_str().to_owned());
        let Some(ip) = ips.next() else {
            debug!("Not an IP connected device, serial: {serial}");
            continue;
        };
        if ips.next().is_some() {
            print_error(&format!("Malformed device IP: {serial}"));
        }
        debug!("Found an IP connected ADB session: {ip}");
        addresses.push(ip);
    }

    let mut failures = 0;
    for ip in addresses {
        let output = device.host(format!("disconnect {ip}")).await?;
        if output.success() {
            print_message(&format!("Disconnected {ip}"));
        } else {
            print_error(&format!("Failed to disconnect {ip}: {}", output.stderr.trim()));
            failures += 1;
        }
    }
    if failures > 0 {
        return Err(CliError::failed(format!(
            "Failed to disconnect {failures} device(s)"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use indoc::indoc;

    use super::*;
    use crate::device::testing::{fail, ok, scripted};

    #[test]
    fn test_parse_adb_device_real_device() {
        let devices = parse_adb_devices([
        r"List of devices attached",
        r"21111FCN20000W         device usb:1234567X product:panther model:Pixel_7 device:panther transport_id:2",
        r""].into_iter());
        assert_eq!("21111FCN20000W", devices[0].serial);
        assert_eq!(Some("Pixel_7"), devices[0].model.as_deref());
        assert!(devices[0].is_authorized());
    }

    #[test]
    fn test_parse_adb_device_unauthorized() {
        let devices = parse_adb_devices(
            [
                r"List of devices attached",
                r"21111FCN20000W         unauthorized usb:1048576X transport_id:3",
                r"",
            ]
            .into_iter(),
        );
        assert_eq!(1, devices.len());
        assert!(!devices[0].is_authorized());
        assert_eq!(None, devices[0].model);
    }

    #[test]
    fn test_parse_adb_device_emulator_and_network() {
        let devices = parse_adb_devices(
            indoc! {"
                List of devices attached
                emulator-5554          device product:sdk_gphone64_arm64 model:sdk_gphone64_arm64 device:emu64a transport_id:1
                192.168.1.20:5555      device product:oriole model:Pixel_6 device:oriole transport_id:4
            "}
            .lines(),
        );
        let serials: Vec<_> = devices.iter().map(|d| d.serial.as_str()).collect();
        assert_eq!(vec!["emulator-5554", "192.168.1.20:5555"], serials);
    }

    #[tokio::test]
    async fn no_devices_is_an_error() {
        let (device, _) = scripted(|_| ok("List of devices attached\n\n"));
        let err = list_devices(&device).await.unwrap_err();
        assert_eq!("No attached Android device found", err.to_string());
    }

    #[tokio::test]
    async fn single_device_info_uses_its_serial() {
        let (device, runner) = scripted(|cmd| match cmd {
            "devices -l" => ok("List of devices attached\nR58M12 device usb:1-1 model:SM_G970F\n"),
            "-s R58M12 shell getprop ro.product.manufacturer" => ok("samsung"),
            "-s R58M12 shell getprop ro.product.model" => ok("SM-G970F"),
            "-s R58M12 shell getprop ro.build.version.release" => ok("12"),
            "-s R58M12 shell getprop ro.build.version.sdk" => ok("31"),
            "-s R58M12 shell getprop ro.product.cpu.abi" => ok("arm64-v8a"),
            "-s R58M12 shell settings get system device_name" => ok("null"),
            "-s R58M12 shell settings get global device_name" => ok("Galaxy S10e"),
            _ => ok(""),
        });
        let info = device_info(&device, "R58M12").await.unwrap();
        assert_eq!(
            indoc! {"
                Serial ID: R58M12
                Manufacturer: samsung
                Model: SM-G970F (Galaxy S10e)
                Release: 12
                SDK version: 31
                CPU: arm64-v8a
            "},
            info
        );
        list_devices(&device).await.unwrap();
        assert!(runner.calls().iter().all(|c| c == "devices -l" || c.starts_with("-s R58M12 ")));
    }

    #[tokio::test]
    async fn enable_wireless_debugging_connects_to_wlan_address() {
        let (device, runner) = scripted(|cmd| match cmd {
            "shell ip address" => ok(indoc! {"
                1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536
                    inet 127.0.0.1/8 scope host lo
                30: wlan0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500
                    inet 192.168.1.20/24 brd 192.168.1.255 scope global wlan0
            "}),
            _ => ok(""),
        });
        enable_wireless_debugging(&device).await.unwrap();
        assert_eq!(
            vec!["shell ip address", "tcpip 5555", "connect 192.168.1.20"],
            runner.calls()
        );
    }

    #[tokio::test]
    async fn disable_wireless_debugging_only_touches_network_devices() {
        let (device, runner) = scripted(|cmd| match cmd {
            "devices -l" => ok(indoc! {"
                List of devices attached
                emulator-5554 device model:sdk
                192.168.1.20:5555 device model:Pixel_6
            "}),
            "disconnect 192.168.1.20:5555" => ok("disconnected 192.168.1.20:5555"),
            _ => fail(1, ""),
        });
        disable_wireless_debugging(&device).await.unwrap();
        assert_eq!(
            vec!["devices -l", "disconnect 192.168.1.20:5555"],
            runner.calls()
        );
    }
}
