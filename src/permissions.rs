//! Runtime permission groups, and granting or revoking a whole group at once.

use std::collections::BTreeSet;

use clap::ValueEnum;
use log::debug;

use crate::{
    device::Device,
    error::{CliError, Result},
    output::{print_error, print_message},
    packages::{dump_package, PermissionsInfo},
};

const MIN_API_FOR_RUNTIME_PERMISSIONS: u32 = 23;
const MIN_API_FOR_POST_NOTIFICATIONS: u32 = 33;
/// Android empties some permission groups from this API level on.
const API_WITH_EMPTIED_GROUPS: u32 = 29;

const POST_NOTIFICATIONS: &str = "android.permission.POST_NOTIFICATIONS";

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum PermissionGroup {
    Calendar,
    Camera,
    Contacts,
    Location,
    Microphone,
    Notifications,
    Phone,
    Sensors,
    Sms,
    Storage,
}

impl PermissionGroup {
    /// The fully qualified group name used by the package manager.
    pub fn qualified_name(self) -> &'static str {
        match self {
            Self::Calendar => "android.permission-group.CALENDAR",
            Self::Camera => "android.permission-group.CAMERA",
            Self::Contacts => "android.permission-group.CONTACTS",
            Self::Location => "android.permission-group.LOCATION",
            Self::Microphone => "android.permission-group.MICROPHONE",
            Self::Notifications => "android.special-permission-group.NOTIFICATIONS",
            Self::Phone => "android.permission-group.PHONE",
            Self::Sensors => "android.permission-group.SENSORS",
            Self::Sms => "android.permission-group.SMS",
            Self::Storage => "android.permission-group.STORAGE",
        }
    }

    /// Members that are always included, since the device may list the group as empty.
    fn known_permissions(self) -> &'static [&'static str] {
        match self {
            Self::Calendar => &[
                "android.permission.READ_CALENDAR",
                "android.permission.WRITE_CALENDAR",
            ],
            Self::Camera => &["android.permission.CAMERA"],
            Self::Contacts => &[
                "android.permission.READ_CONTACTS",
                "android.permission.WRITE_CONTACTS",
            ],
            Self::Location => &[
                "android.permission.ACCESS_FINE_LOCATION",
                "android.permission.ACCESS_COARSE_LOCATION",
            ],
            Self::Microphone => &["android.permission.RECORD_AUDIO"],
            Self::Notifications => &[POST_NOTIFICATIONS],
            Self::Phone => &[
                "android.permission.READ_PHONE_STATE",
                "android.permission.READ_PHONE_NUMBERS",
                "android.permission.CALL_PHONE",
                "android.permission.ANSWER_PHONE_CALLS",
            ],
            Self::Sensors => &["android.permission.BODY_SENSORS"],
            Self::Sms => &[
                "android.permission.READ_SMS",
                "android.permission.RECEIVE_SMS",
                "android.permission.SEND_SMS",
            ],
            Self::Storage => &[
                "android.permission.READ_EXTERNAL_STORAGE",
                "android.permission.WRITE_EXTERNAL_STORAGE",
            ],
        }
    }

    /// <https://github.com/ashishb/adb-enhanced/runs/1799363523>
    fn emptied_on_newer_devices(self) -> bool {
        matches!(
            self,
            Self::Contacts | Self::Microphone | Self::Location | Self::Sms
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum PermissionAction {
    Grant,
    Revoke,
}

impl PermissionAction {
    fn as_str(self) -> &'static str {
        match self {
            Self::Grant => "grant",
            Self::Revoke => "revoke",
        }
    }

    fn past_tense(self) -> &'static str {
        match self {
            Self::Grant => "granted",
            Self::Revoke => "revoked",
        }
    }
}

/// Members of `group` in the output of `pm list permissions -g`, or `None` if the group isn't
/// listed.
fn scrape_group_members(listing: &str, group: &str) -> Option<Vec<String>> {
    let grouped = listing
        .split_once("ungrouped:")
        .map_or(listing, |(grouped, _)| grouped);
    let section = grouped
        .split("group:")
        .find(|section| section.starts_with(group))?;
    Some(
        section
            .lines()
            // The group name
            .skip(1)
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| line.replace("permission:", ""))
            .collect(),
    )
}

/// Scraped group members merged with the known ones. Groups that API 29 emptied only get the
/// scraped members on those devices.
pub async fn permissions_in_group(device: &Device, group: PermissionGroup) -> Result<Vec<String>> {
    let cmd = "pm list permissions -g";
    let output = device.shell(cmd).await?;
    if !output.success() {
        return Err(CliError::failed(format!(
            "Failed to run command {cmd} (stdout: {}, stderr: {})",
            output.text(),
            output.stderr.trim()
        )));
    }
    let mut known: Vec<String> = group
        .known_permissions()
        .iter()
        .map(|p| p.to_string())
        .collect();
    if group.emptied_on_newer_devices()
        && device.api_version().await? >= API_WITH_EMPTIED_GROUPS
    {
        debug!("{} is empty on this API level", group.qualified_name());
        known.clear();
    }
    let Some(scraped) = scrape_group_members(output.text(), group.qualified_name()) else {
        return Ok(known);
    };
    let permissions: BTreeSet<String> = scraped.into_iter().chain(known).collect();
    let permissions: Vec<String> = permissions.into_iter().collect();
    print_message(&format!(
        "Permissions in {} group are {permissions:?}",
        group.qualified_name()
    ));
    Ok(permissions)
}

pub async fn grant_or_revoke(
    device: &Device,
    package: &str,
    action: PermissionAction,
    group: PermissionGroup,
) -> Result<()> {
    let permissions = permissions_in_group(device, group).await?;
    if permissions.is_empty() {
        let api_version = device.api_version().await?;
        if group.emptied_on_newer_devices() && api_version >= API_WITH_EMPTIED_GROUPS {
            return Err(CliError::failed(format!(
                "Android has made some permission group empty on API 29 and beyond, \
                 your device version is {api_version}"
            )));
        }
        return Err(CliError::failed(format!(
            "No permissions found in permissions group: {}",
            group.qualified_name()
        )));
    }

    device.ensure_package_exists(package).await?;
    device.require_api(MIN_API_FOR_RUNTIME_PERMISSIONS).await?;
    let requested = PermissionsInfo::from_dump(&dump_package(device, package).await?);

    let verb = action.as_str();
    let mut acted_on = 0;
    for permission in &permissions {
        if !requested.mentions(permission) {
            print_message(&format!(
                "Permission {permission} is not requested by {package}, skipping"
            ));
            continue;
        }
        if permission == POST_NOTIFICATIONS {
            device.require_api(MIN_API_FOR_POST_NOTIFICATIONS).await?;
        }
        acted_on += 1;
        print_message(&format!("{verb} {permission} permission to {package}"));
        let output = device
            .shell(format!("pm {verb} {package} {permission}"))
            .await?;
        if !output.success() {
            print_error(&format!(
                "Failed to {verb} {permission}: {}",
                output.stderr.trim()
            ));
        }
    }
    if acted_on == 0 {
        return Err(CliError::failed(format!(
            "None of these permissions were {} to {package}: {permissions:?}",
            action.past_tense()
        )));
    }
    debug!("{} {acted_on} permission(s)", action.past_tense());
    Ok(())
}

pub async fn list_permission_groups(device: &Device) -> Result<()> {
    let output = device.shell("pm list permission-groups").await?;
    if !output.success() {
        return Err(CliError::failed("Failed to list permission groups"));
    }
    print_message(output.text());
    Ok(())
}

pub async fn list_permissions(device: &Device, dangerous_only: bool) -> Result<()> {
    // -g groups them by permission group
    let cmd = if dangerous_only {
        "pm list permissions -g -d"
    } else {
        "pm list permissions -g"
    };
    let output = device.shell(cmd).await?;
    if !output.success() {
        return Err(CliError::failed(format!(
            "Failed to list permissions: (stdout: {}, stderr: {})",
            output.text(),
            output.stderr.trim()
        )));
    }
    print_message(output.text());
    Ok(())
}

#[cfg(test)]
mod test {
    use indoc::indoc;

    use super::*;
    use crate::device::testing::{fail, ok, scripted};

    const LISTING: &str = indoc! {"
        All Permissions:

        group:android.permission-group.CONTACTS

        group:android.permission-group.STORAGE
          permission:android.permission.READ_EXTERNAL_STORAGE
          permission:android.permission.ACCESS_MEDIA_LOCATION

        ungrouped:
          permission:android.permission.INTERNET
    "};

    const STORAGE_APP_DUMP: &str = indoc! {"
        Package [com.example.app] (f00ba4):
        requested permissions:
          android.permission.INTERNET
          android.permission.READ_EXTERNAL_STORAGE
        install permissions:
          android.permission.INTERNET: granted=true
        runtime permissions:
          android.permission.READ_EXTERNAL_STORAGE: granted=false
    "};

    #[test]
    fn scrape_listed_group() {
        assert_eq!(
            Some(vec![
                "android.permission.READ_EXTERNAL_STORAGE".to_owned(),
                "android.permission.ACCESS_MEDIA_LOCATION".to_owned(),
            ]),
            scrape_group_members(LISTING, "android.permission-group.STORAGE")
        );
        assert_eq!(
            Some(vec![]),
            scrape_group_members(LISTING, "android.permission-group.CONTACTS")
        );
        assert_eq!(None, scrape_group_members(LISTING, "android.permission-group.SMS"));
    }

    #[test]
    fn ungrouped_permissions_are_ignored() {
        let members = scrape_group_members(LISTING, "android.permission-group.STORAGE").unwrap();
        assert!(!members.contains(&"android.permission.INTERNET".to_owned()));
    }

    #[tokio::test]
    async fn group_members_include_known_ones() {
        let (device, _) = scripted(|cmd| match cmd {
            "shell pm list permissions -g" => ok(LISTING),
            "shell getprop ro.build.version.sdk" => ok("28"),
            _ => fail(1, ""),
        });
        assert_eq!(
            vec![
                "android.permission.ACCESS_MEDIA_LOCATION",
                "android.permission.READ_EXTERNAL_STORAGE",
                "android.permission.WRITE_EXTERNAL_STORAGE",
            ],
            permissions_in_group(&device, PermissionGroup::Storage).await.unwrap()
        );
        assert_eq!(
            vec!["android.permission.RECORD_AUDIO"],
            permissions_in_group(&device, PermissionGroup::Microphone).await.unwrap()
        );
    }

    #[tokio::test]
    async fn grant_only_requested_permissions() {
        let (device, runner) = scripted(|cmd| match cmd {
            "shell pm list permissions -g" => ok(LISTING),
            "shell pm path com.example.app" => ok("package:/data/app/base.apk"),
            "shell getprop ro.build.version.sdk" => ok("30"),
            "shell dumpsys package com.example.app" => ok(STORAGE_APP_DUMP),
            _ => ok(""),
        });
        grant_or_revoke(
            &device,
            "com.example.app",
            PermissionAction::Grant,
            PermissionGroup::Storage,
        )
        .await
        .unwrap();
        let grants: Vec<_> = runner
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("shell pm grant"))
            .collect();
        assert_eq!(
            vec!["shell pm grant com.example.app android.permission.READ_EXTERNAL_STORAGE"],
            grants
        );
    }

    #[tokio::test]
    async fn nothing_to_revoke_is_an_error() {
        let (device, runner) = scripted(|cmd| match cmd {
            "shell pm list permissions -g" => ok(LISTING),
            "shell pm path com.example.app" => ok("package:/data/app/base.apk"),
            "shell getprop ro.build.version.sdk" => ok("30"),
            "shell dumpsys package com.example.app" => ok(STORAGE_APP_DUMP),
            _ => ok(""),
        });
        let err = grant_or_revoke(
            &device,
            "com.example.app",
            PermissionAction::Revoke,
            PermissionGroup::Camera,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().starts_with("None of these permissions were revoked"));
        assert!(runner.calls().iter().all(|c| !c.starts_with("shell pm revoke")));
    }

    #[tokio::test]
    async fn runtime_permissions_need_api_23() {
        let (device, _) = scripted(|cmd| match cmd {
            "shell pm list permissions -g" => ok(LISTING),
            "shell pm path com.example.app" => ok("package:/data/app/base.apk"),
            "shell getprop ro.build.version.sdk" => ok("22"),
            _ => ok(""),
        });
        assert!(matches!(
            grant_or_revoke(
                &device,
                "com.example.app",
                PermissionAction::Grant,
                PermissionGroup::Storage
            )
            .await,
            Err(CliError::ApiTooLow { required: 23, actual: 22 })
        ));
    }

    #[tokio::test]
    async fn post_notifications_needs_api_33() {
        let (device, runner) = scripted(|cmd| match cmd {
            "shell pm list permissions -g" => ok(LISTING),
            "shell pm path com.example.app" => ok("package:/data/app/base.apk"),
            "shell getprop ro.build.version.sdk" => ok("32"),
            "shell dumpsys package com.example.app" => ok(indoc! {"
                requested permissions:
                  android.permission.POST_NOTIFICATIONS
                runtime permissions:
            "}),
            _ => ok(""),
        });
        assert!(matches!(
            grant_or_revoke(
                &device,
                "com.example.app",
                PermissionAction::Grant,
                PermissionGroup::Notifications
            )
            .await,
            Err(CliError::ApiTooLow { required: 33, actual: 32 })
        ));
        assert!(runner.calls().iter().all(|c| !c.starts_with("shell pm grant")));
    }

    #[tokio::test]
    async fn emptied_group_on_api_29_is_an_error() {
        let (device, runner) = scripted(|cmd| match cmd {
            "shell pm list permissions -g" => ok(LISTING),
            "shell getprop ro.build.version.sdk" => ok("29"),
            _ => ok(""),
        });
        let err = grant_or_revoke(
            &device,
            "com.example.app",
            PermissionAction::Grant,
            PermissionGroup::Contacts,
        )
        .await
        .unwrap_err();
        assert_eq!(
            "Android has made some permission group empty on API 29 and beyond, \
             your device version is 29",
            err.to_string()
        );
        assert!(runner.calls().iter().all(|c| !c.starts_with("shell pm grant")));
    }

    #[tokio::test]
    async fn emptied_group_keeps_known_members_before_api_29() {
        let (device, _) = scripted(|cmd| match cmd {
            "shell pm list permissions -g" => ok(LISTING),
            "shell getprop ro.build.version.sdk" => ok("28"),
            _ => fail(1, ""),
        });
        assert_eq!(
            vec![
                "android.permission.READ_CONTACTS",
                "android.permission.WRITE_CONTACTS",
            ],
            permissions_in_group(&device, PermissionGroup::Contacts).await.unwrap()
        );
    }
}
