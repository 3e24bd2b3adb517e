#![deny(unused_must_use)]

use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::{error::ErrorKind, ArgAction, Parser, Subcommand, ValueEnum};
use log::debug;

use adb::{get_adb_path, Adb};
use config::{Config, DeviceSelection, InspectionMode, DEFAULT_EXIT_CODE_API_FLOOR};
use device::Device;
use dumpsys::AlarmKind;
use error::{CliError, Result};
use output::{init_logger, print_error};
use packages::{AppsFilter, StandbyBucket};
use permissions::{PermissionAction, PermissionGroup};
use screen::ScreenSwitch;
use settings::{GfxMode, OverdrawMode, Rotation};

mod adb;
mod config;
mod device;
mod devices;
mod dumpsys;
mod error;
mod files;
mod inspect;
mod output;
mod packages;
mod permissions;
mod screen;
mod settings;
mod state;

/// Swiss-army knife for Android testing and development, built on top of adb.
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct AdbeArgs {
    /// Direct commands to the only running emulator.
    #[arg(short = 'e', long, global = true)]
    pub emulator: bool,

    /// Direct commands to the only USB-connected device.
    #[arg(short = 'd', long = "device", global = true)]
    pub usb: bool,

    /// Direct commands to the device or emulator with the given serial number.
    #[arg(short = 's', long, global = true)]
    pub serial: Option<String>,

    /// Print every command executed on the device.
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Path to the adb executable. Looked up on the PATH when not given.
    #[arg(long, env = "ADBE_ADB_PATH", global = true)]
    pub adb_path: Option<String>,

    /// Devices below this API level report success from `adb shell` even when the command
    /// failed.
    #[arg(long, env = "ADBE_EXIT_CODE_API_FLOOR", default_value_t = DEFAULT_EXIT_CODE_API_FLOOR, hide = true, global = true)]
    pub exit_code_api_floor: u32,

    /// Inspect packages one at a time with a progress indicator, instead of in parallel.
    #[arg(long, env = "ADBE_SEQUENTIAL", global = true)]
    pub sequential: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Switch {
    On,
    Off,
}

impl Switch {
    fn is_on(self) -> bool {
        self == Switch::On
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ListScope {
    All,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum PermissionsScope {
    All,
    Dangerous,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Key {
    Back,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List connected devices with their properties.
    Devices,
    /// Switch the device to adb over Wi-Fi.
    Enable {
        #[command(subcommand)]
        target: WirelessTarget,
    },
    /// Disconnect all devices connected over Wi-Fi.
    Disable {
        #[command(subcommand)]
        target: WirelessTarget,
    },
    /// Rotate the screen.
    Rotate { rotation: Rotation },
    /// Profile GPU rendering.
    Gfx { mode: GfxMode },
    /// Show GPU overdraw.
    Overdraw { mode: OverdrawMode },
    /// Show layout bounds.
    Layout { switch: Switch },
    Airplane { switch: Switch },
    /// Simulate battery states.
    Battery {
        #[command(subcommand)]
        command: BatteryCommand,
    },
    /// Force the device into or out of doze.
    Doze { switch: Switch },
    MobileData {
        #[command(subcommand)]
        command: MobileDataCommand,
    },
    Wifi { switch: Switch },
    /// Force right-to-left layout.
    Rtl { switch: Switch },
    Animations { switch: Switch },
    ShowTaps { switch: Switch },
    StayAwakeWhileCharging { switch: Switch },
    DontKeepActivities { switch: Switch },
    Dark {
        #[command(subcommand)]
        target: DarkTarget,
    },
    Location { switch: Switch },
    /// Print the alarms registered with the alarm manager.
    Alarm { kind: AlarmKind },
    Screen { switch: ScreenSwitch },
    /// Print the package and activity in the foreground.
    TopActivity,
    /// Dump the UI hierarchy to an XML file on the host.
    DumpUi { xml_file: String },
    Screenshot { png_file: String },
    /// Record the screen until Ctrl+C is pressed.
    Screenrecord { mp4_file: String },
    InputText { text: String },
    Press { key: Key },
    OpenUrl { url: String },
    Notifications {
        #[command(subcommand)]
        command: NotificationsCommand,
    },
    Apps {
        #[command(subcommand)]
        command: AppsCommand,
    },
    App {
        #[command(subcommand)]
        command: AppCommand,
    },
    Start { package: String },
    Stop { package: String },
    ForceStop { package: String },
    Restart { package: String },
    ClearData { package: String },
    Install { apk: String },
    Uninstall {
        /// Only uninstall for the first user.
        #[arg(long)]
        first_user: bool,
        package: String,
    },
    /// Print the janky frame statistics of a package.
    Jank { package: String },
    StandbyBucket {
        #[command(subcommand)]
        command: StandbyBucketCommand,
    },
    RestrictBackground {
        #[arg(action = ArgAction::Set)]
        restrict: bool,
        package: String,
    },
    DebugApp {
        #[command(subcommand)]
        command: DebugAppCommand,
    },
    PermissionGroups {
        #[command(subcommand)]
        command: PermissionGroupsCommand,
    },
    Permissions {
        #[command(subcommand)]
        command: PermissionsCommand,
    },
    Ls {
        /// Hidden files are always listed.
        #[arg(short = 'a')]
        all: bool,
        #[arg(short = 'l')]
        long_format: bool,
        #[arg(short = 'R', short_alias = 'r')]
        recursive: bool,
        path: String,
    },
    Rm {
        #[arg(short = 'f')]
        force: bool,
        #[arg(short = 'R', short_alias = 'r')]
        recursive: bool,
        path: String,
    },
    Mv {
        #[arg(short = 'f')]
        force: bool,
        src: String,
        dest: String,
    },
    Pull {
        /// Also pull the companion files of SQLite databases.
        #[arg(short = 'a')]
        copy_ancillary: bool,
        remote: String,
        local: Option<String>,
    },
    Push { local: String, remote: String },
    Cat { path: String },
}

#[derive(Debug, Subcommand)]
pub enum WirelessTarget {
    Wireless {
        #[command(subcommand)]
        target: DebuggingTarget,
    },
}

#[derive(Debug, Subcommand)]
pub enum DebuggingTarget {
    Debugging,
}

#[derive(Debug, Subcommand)]
pub enum DarkTarget {
    Mode { switch: Switch },
}

#[derive(Debug, Subcommand)]
pub enum BatteryCommand {
    /// Set the reported battery percentage.
    Level {
        #[arg(allow_negative_numbers = true)]
        level: i64,
    },
    /// Go back to the real battery state.
    Reset,
    Saver { switch: Switch },
}

#[derive(Debug, Subcommand)]
pub enum MobileDataCommand {
    On,
    Off,
    Saver { switch: Switch },
}

#[derive(Debug, Subcommand)]
pub enum NotificationsCommand {
    List,
}

#[derive(Debug, Subcommand)]
pub enum AppsCommand {
    List { filter: AppsFilter },
}

#[derive(Debug, Subcommand)]
pub enum AppCommand {
    Info { package: String },
    Path { package: String },
    Signature { package: String },
    /// Back up the app's data into a tar file. Needs `java` on the PATH.
    Backup {
        package: String,
        tar_file: PathBuf,
        /// The Android Backup Extractor jar that converts the backup to tar.
        #[arg(long, env = "ADBE_ABE_JAR")]
        abe_jar: Option<PathBuf>,
    },
}

#[derive(Debug, Subcommand)]
pub enum StandbyBucketCommand {
    Get { package: String },
    Set { package: String, bucket: StandbyBucket },
}

#[derive(Debug, Subcommand)]
pub enum DebugAppCommand {
    Set {
        /// Wait for a debugger to attach on launch.
        #[arg(short = 'w')]
        wait_for_debugger: bool,
        /// Keep the debug app across launches.
        #[arg(short = 'p', long)]
        persistent: bool,
        package: String,
    },
    Clear,
}

#[derive(Debug, Subcommand)]
pub enum PermissionGroupsCommand {
    List { scope: ListScope },
}

#[derive(Debug, Subcommand)]
pub enum PermissionsCommand {
    Grant {
        package: String,
        group: PermissionGroup,
    },
    Revoke {
        package: String,
        group: PermissionGroup,
    },
    List { scope: PermissionsScope },
}

fn config_from_args(args: &AdbeArgs, selection: DeviceSelection, adb_path: String) -> Config {
    Config {
        adb_path,
        selection,
        verbose: args.verbose,
        exit_code_api_floor: args.exit_code_api_floor,
        inspection: if args.sequential {
            InspectionMode::Sequential
        } else {
            InspectionMode::Parallel
        },
    }
}

async fn dispatch(device: &Device, config: &Config, command: Command) -> Result<()> {
    match command {
        Command::Devices => devices::list_devices(device).await,
        Command::Enable {
            target: WirelessTarget::Wireless {
                target: DebuggingTarget::Debugging,
            },
        } => devices::enable_wireless_debugging(device).await,
        Command::Disable {
            target: WirelessTarget::Wireless {
                target: DebuggingTarget::Debugging,
            },
        } => devices::disable_wireless_debugging(device).await,
        Command::Rotate { rotation } => settings::rotate(device, rotation).await,
        Command::Gfx { mode } => settings::gfx(device, mode).await,
        Command::Overdraw { mode } => settings::overdraw(device, mode).await,
        Command::Layout { switch } => settings::layout(device, switch.is_on()).await,
        Command::Airplane { switch } => settings::airplane(device, switch.is_on()).await,
        Command::Battery { command } => match command {
            BatteryCommand::Level { level } => settings::battery_level(device, level).await,
            BatteryCommand::Reset => settings::battery_reset(device).await,
            BatteryCommand::Saver { switch } => {
                settings::battery_saver(device, switch.is_on()).await
            }
        },
        Command::Doze { switch } => settings::doze(device, switch.is_on()).await,
        Command::MobileData { command } => match command {
            MobileDataCommand::On => settings::mobile_data(device, true).await,
            MobileDataCommand::Off => settings::mobile_data(device, false).await,
            MobileDataCommand::Saver { switch } => {
                settings::mobile_data_saver(device, switch.is_on()).await
            }
        },
        Command::Wifi { switch } => settings::wifi(device, switch.is_on()).await,
        Command::Rtl { switch } => settings::rtl(device, switch.is_on()).await,
        Command::Animations { switch } => settings::animations(device, switch.is_on()).await,
        Command::ShowTaps { switch } => settings::show_taps(device, switch.is_on()).await,
        Command::StayAwakeWhileCharging { switch } => {
            settings::stay_awake_while_charging(device, switch.is_on()).await
        }
        Command::DontKeepActivities { switch } => {
            settings::dont_keep_activities(device, switch.is_on()).await
        }
        Command::Dark {
            target: DarkTarget::Mode { switch },
        } => settings::dark_mode(device, switch.is_on()).await,
        Command::Location { switch } => settings::location(device, switch.is_on()).await,
        Command::Alarm { kind } => dumpsys::alarms(device, kind).await,
        Command::Screen { switch } => screen::switch_screen(device, switch).await,
        Command::TopActivity => screen::print_top_activity(device).await,
        Command::DumpUi { xml_file } => screen::dump_ui(device, &xml_file).await,
        Command::Screenshot { png_file } => screen::screenshot(device, &png_file).await,
        Command::Screenrecord { mp4_file } => screen::screenrecord(device, &mp4_file).await,
        Command::InputText { text } => screen::input_text(device, &text).await,
        Command::Press { key: Key::Back } => screen::press_back(device).await,
        Command::OpenUrl { url } => screen::open_url(device, &url).await,
        Command::Notifications {
            command: NotificationsCommand::List,
        } => dumpsys::notifications(device).await,
        Command::Apps {
            command: AppsCommand::List { filter },
        } => packages::list_apps(device, filter, config.inspection).await,
        Command::App { command } => match command {
            AppCommand::Info { package } => packages::app_info(device, &package).await,
            AppCommand::Path { package } => packages::app_path(device, &package).await,
            AppCommand::Signature { package } => packages::app_signature(device, &package).await,
            AppCommand::Backup {
                package,
                tar_file,
                abe_jar,
            } => packages::app_backup(device, &package, &tar_file, abe_jar.as_deref()).await,
        },
        Command::Start { package } => packages::launch_app(device, &package).await,
        Command::Stop { package } => packages::stop_app(device, &package).await,
        Command::ForceStop { package } => packages::force_stop(device, &package).await,
        Command::Restart { package } => packages::restart_app(device, &package).await,
        Command::ClearData { package } => packages::clear_data(device, &package).await,
        Command::Install { apk } => packages::install(device, &apk).await,
        Command::Uninstall {
            first_user,
            package,
        } => packages::uninstall(device, &package, first_user).await,
        Command::Jank { package } => packages::jank(device, &package).await,
        Command::StandbyBucket { command } => match command {
            StandbyBucketCommand::Get { package } => {
                packages::get_standby_bucket(device, &package).await
            }
            StandbyBucketCommand::Set { package, bucket } => {
                packages::set_standby_bucket(device, &package, bucket).await
            }
        },
        Command::RestrictBackground { restrict, package } => {
            packages::restrict_background(device, &package, restrict).await
        }
        Command::DebugApp { command } => match command {
            DebugAppCommand::Set {
                wait_for_debugger,
                persistent,
                package,
            } => packages::set_debug_app(device, &package, wait_for_debugger, persistent).await,
            DebugAppCommand::Clear => packages::clear_debug_app(device).await,
        },
        Command::PermissionGroups {
            command: PermissionGroupsCommand::List { scope: ListScope::All },
        } => permissions::list_permission_groups(device).await,
        Command::Permissions { command } => match command {
            PermissionsCommand::Grant { package, group } => {
                permissions::grant_or_revoke(device, &package, PermissionAction::Grant, group)
                    .await
            }
            PermissionsCommand::Revoke { package, group } => {
                permissions::grant_or_revoke(device, &package, PermissionAction::Revoke, group)
                    .await
            }
            PermissionsCommand::List { scope } => {
                permissions::list_permissions(device, scope == PermissionsScope::Dangerous).await
            }
        },
        Command::Ls {
            all,
            long_format,
            recursive,
            path,
        } => {
            if !all {
                debug!("Listing hidden files of {path} regardless of -a");
            }
            files::list_directory(device, &path, long_format, recursive).await
        }
        Command::Rm {
            force,
            recursive,
            path,
        } => files::delete_file(device, &path, force, recursive).await,
        Command::Mv { force, src, dest } => files::move_file(device, &src, &dest, force).await,
        Command::Pull {
            copy_ancillary,
            remote,
            local,
        } => files::pull_file(device, &remote, local.as_deref(), copy_ancillary).await,
        Command::Push { local, remote } => files::push_file(device, &local, &remote).await,
        Command::Cat { path } => files::cat_file(device, &path).await,
    }
}

async fn run(args: AdbeArgs) -> Result<()> {
    // Checked before anything is spawned.
    let selection = DeviceSelection::from_flags(args.emulator, args.usb, args.serial.clone())?;
    let adb_path = match &args.adb_path {
        Some(adb_path) => adb_path.clone(),
        None => get_adb_path().await.to_string_lossy().into_owned(),
    };
    let config = config_from_args(&args, selection, adb_path);
    init_logger(config.verbose);
    debug!("Running with args: {args:#?}");
    let device = Device::new(
        Arc::new(Adb::new(config.adb_path.clone(), config.selection.clone())),
        &config,
    );
    dispatch(&device, &config, args.command).await
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match AdbeArgs::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            e.exit()
        }
        Err(e) => {
            let _ = e.print();
            let argv: Vec<String> = std::env::args().skip(1).collect();
            print_error(&CliError::NotImplemented(argv.join(" ")).to_string());
            return ExitCode::from(1);
        }
    };
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            print_error(&e.to_string());
            ExitCode::from(1)
        }
    }
}
