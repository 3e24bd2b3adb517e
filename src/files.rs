//! File operations on the device.
//!
//! A path inside an app's private directory is only reachable through `run-as <package>` (for
//! debuggable apps) and most paths outside `/data/local/tmp` and `/sdcard` need root. Every
//! command is therefore tried with each applicable prefix in turn, falling back to a plain shell.

use std::path::Path;

use log::debug;

use crate::{
    adb::{AdbCommand, CommandOutput},
    device::Device,
    error::{CliError, Result},
    output::{print_error, print_message},
};

const TMP_DIR: &str = "/data/local/tmp";
const FILE_NOT_FOUND: &str = "No such file or directory";
/// Deleting a directory without `-r`
const IS_A_DIRECTORY: &str = "Is a directory";
const SQLITE_COMPANION_SUFFIXES: [&str; 3] = ["wal", "journal", "shm"];

/// The package owning `path`, for paths under `/data/data/<package>` or
/// `/data/user/<n>/<package>`.
pub fn package_of(path: &str) -> Option<&str> {
    let items: Vec<&str> = path.split('/').collect();
    if path.starts_with("/data/data/") && items.len() >= 4 {
        return Some(items[3]).filter(|p| !p.is_empty());
    }
    // Multi-user layout
    if path.starts_with("/data/user/") && items.len() >= 5 {
        return Some(items[4]).filter(|p| !p.is_empty());
    }
    None
}

pub fn root_required(path: &str) -> bool {
    !(path.is_empty() || path.starts_with(TMP_DIR) || path.starts_with("/sdcard"))
}

/// Shell prefixes to try, in order.
fn access_prefixes(path: Option<&str>) -> Vec<String> {
    let mut prefixes = Vec::new();
    if let Some(path) = path {
        if let Some(package) = package_of(path) {
            prefixes.push(format!("run-as {package} "));
        }
        if root_required(path) {
            prefixes.push("su root ".to_owned());
        }
    }
    prefixes.push(String::new());
    prefixes
}

/// Runs `command` with each access prefix until one of them works.
///
/// A zero exit code only counts as success on devices that report shell exit codes faithfully;
/// on older ones every prefix is tried and the last output wins.
pub async fn execute_file_command(
    device: &Device,
    command: &str,
    path: Option<&str>,
) -> Result<Option<String>> {
    let prefixes = access_prefixes(path);
    let shown_path = path.unwrap_or_default();
    let mut stdout = None;
    for (attempt, prefix) in prefixes.iter().enumerate() {
        debug!(
            "Attempt {}/{}: \"shell {}\"",
            attempt + 1,
            prefixes.len(),
            prefix.trim_end()
        );
        let output: CommandOutput = device
            .execute(AdbCommand::shell(format!("{prefix}{command}")))
            .await?;
        if output.stderr.contains(FILE_NOT_FOUND) {
            return Err(CliError::failed(format!("File not found: {shown_path}")));
        }
        if output.stderr.contains(IS_A_DIRECTORY) {
            return Err(CliError::failed(format!("{shown_path} is a directory")));
        }
        let succeeded = output.success() && device.exit_code_trusted().await?;
        stdout = output.stdout;
        if succeeded {
            break;
        }
    }
    Ok(stdout)
}

/// Whether `path` exists and is reachable with one of the access prefixes.
pub async fn file_exists(device: &Device, path: &str) -> Result<bool> {
    let cmd = format!("\"ls {path} 1>/dev/null 2>/dev/null && echo exists\"");
    let stdout = execute_file_command(device, &cmd, Some(path)).await?;
    Ok(stdout.is_some_and(|s| s.contains("exists")))
}

/// Creates an empty, world-writable file in `/data/local/tmp` and returns its path.
pub async fn create_tmp_file(device: &Device, prefix: &str, suffix: &str) -> Result<String> {
    for (kind, value) in [("prefix", prefix), ("suffix", suffix)] {
        if value.contains('/') {
            return Err(CliError::InvalidArgument(format!(
                "Filename {kind} \"{value}\" contains illegal character: \"/\""
            )));
        }
    }

    let path = loop {
        let candidate = format!(
            "{TMP_DIR}/{prefix}-{}.{suffix}",
            rand::random_range(0..1_000_000_000u32)
        );
        if !file_exists(device, &candidate).await? {
            break candidate;
        }
        debug!("Tmp file {candidate} already exists, trying a new random name");
    };

    let output = device.shell(format!("touch {path}")).await?;
    if !output.success() {
        return Err(CliError::failed(format!(
            "Failed to create tmp file {path}: (stdout: {}, stderr: {})",
            output.text(),
            output.stderr.trim()
        )));
    }
    // Otherwise run-as can't write to it.
    let output = device.shell(format!("chmod 666 {path}")).await?;
    if !output.success() {
        return Err(CliError::failed(format!(
            "Failed to chmod tmp file {path}: (stdout: {}, stderr: {})",
            output.text(),
            output.stderr.trim()
        )));
    }
    Ok(path)
}

fn print_if_some(stdout: Option<String>) {
    if let Some(stdout) = stdout {
        print_message(&stdout);
    }
}

/// Hidden files are always listed.
pub async fn list_directory(
    device: &Device,
    path: &str,
    long_format: bool,
    recursive: bool,
) -> Result<()> {
    let mut cmd = String::from("ls");
    if long_format {
        cmd += " -l";
    }
    if recursive {
        cmd += " -R";
    }
    cmd += &format!(" -a \"{path}\"");
    print_if_some(execute_file_command(device, &cmd, Some(path)).await?);
    Ok(())
}

pub async fn delete_file(device: &Device, path: &str, force: bool, recursive: bool) -> Result<()> {
    let mut cmd = String::from("rm");
    if force {
        cmd += " -f";
    }
    if recursive {
        cmd += " -r";
    }
    cmd += &format!(" {path}");
    print_if_some(execute_file_command(device, &cmd, Some(path)).await?);
    Ok(())
}

/// Only the side owned by a package gets `run-as`, so moves between two packages are refused.
pub async fn move_file(device: &Device, src: &str, dest: &str, force: bool) -> Result<()> {
    let (src_package, dest_package) = (package_of(src), package_of(dest));
    if let (Some(a), Some(b)) = (src_package, dest_package) {
        if a != b {
            return Err(CliError::failed(
                "Cannot copy a file from one package into another, copy it via /data/local/tmp instead",
            ));
        }
    }
    let cmd = format!("mv{} {src} {dest}", if force { " -f" } else { "" });
    let access_path = if src_package.is_some() {
        Some(src)
    } else if dest_package.is_some() {
        Some(dest)
    } else {
        None
    };
    print_if_some(execute_file_command(device, &cmd, access_path).await?);
    debug!("Moved \"{src}\" to \"{dest}\"");
    Ok(())
}

pub async fn cat_file(device: &Device, path: &str) -> Result<()> {
    print_if_some(execute_file_command(device, &format!("cat {path}"), Some(path)).await?);
    Ok(())
}

fn is_sqlite_database(path: &str) -> bool {
    path.ends_with(".db")
}

async fn pull_one(device: &Device, remote: &str, local: &str) -> Result<()> {
    if !file_exists(device, remote).await? {
        return Err(CliError::failed(format!("File {remote} does not exist")));
    }

    if package_of(remote).is_none() && !root_required(remote) {
        debug!("File {remote} is not inside a package, no temporary file required");
        device.host(format!("pull {remote} \"{local}\"")).await?;
    } else {
        // Copy to a temp file the shell user can read, pull that, then delete it.
        let tmp_file = create_tmp_file(device, "file", "tmp").await?;
        execute_file_command(device, &format!("cp -r {remote} {tmp_file}"), Some(remote)).await?;
        device.host(format!("pull {tmp_file} \"{local}\"")).await?;
        device.shell(format!("rm -r {tmp_file}")).await?;
    }

    match tokio::fs::metadata(local).await {
        Ok(metadata) => {
            print_message(&format!(
                "Copied remote file \"{remote}\" to local file \"{local}\" (Size: {} bytes)",
                metadata.len()
            ));
            Ok(())
        }
        Err(_) => Err(CliError::failed(format!(
            "Failed to copy remote file \"{remote}\" to local file \"{local}\""
        ))),
    }
}

/// Pulls `remote` to `local` (or to its file name in the working directory). For SQLite
/// databases the `-wal`, `-journal` and `-shm` companions are pulled too with `copy_ancillary`,
/// and only pointed out otherwise.
pub async fn pull_file(
    device: &Device,
    remote: &str,
    local: Option<&str>,
    copy_ancillary: bool,
) -> Result<()> {
    let local = match local {
        Some(local) => local.to_owned(),
        None => {
            let name = remote.rsplit('/').next().unwrap_or(remote).to_owned();
            debug!("Local file path not provided, using \"{name}\" for that");
            name
        }
    };
    pull_one(device, remote, &local).await?;

    if !is_sqlite_database(remote) {
        return Ok(());
    }
    // https://ashishb.net/all/android-the-right-way-to-pull-sqlite-database-from-the-device/
    for suffix in SQLITE_COMPANION_SUFFIXES {
        let companion = format!("{remote}-{suffix}");
        if !file_exists(device, &companion).await? {
            continue;
        }
        if copy_ancillary {
            pull_one(device, &companion, &format!("{local}-{suffix}")).await?;
        } else {
            print_error(&format!(
                "File \"{remote}\" has an ancillary file \"{companion}\" which should be copied.\n\
                 See \"https://ashishb.net/all/android-the-right-way-to-pull-sqlite-database-from-the-device/\" for details"
            ));
        }
    }
    Ok(())
}

/// Pushing into a directory fails silently on some Android versions, so `remote` should be a
/// full file path.
pub async fn push_file(device: &Device, local: &str, remote: &str) -> Result<()> {
    let metadata = tokio::fs::metadata(local)
        .await
        .map_err(|_| CliError::failed(format!("Local file {local} does not exist")))?;
    if metadata.is_dir() {
        return Err(CliError::failed(format!(
            "This tool does not support pushing a directory yet: {local}"
        )));
    }

    let tmp_file = create_tmp_file(device, "file", "tmp").await?;
    let output = device
        .host(format!("push \"{}\" {tmp_file}", Path::new(local).display()))
        .await?;
    if !output.success() {
        return Err(CliError::failed(format!(
            "Failed to push file, error: {}",
            output.stderr.trim()
        )));
    }
    // `mv` out of /data/local/tmp under run-as is unreliable, so copy and delete.
    execute_file_command(device, &format!("cp {tmp_file} {remote}"), Some(remote)).await?;
    device.shell(format!("rm {tmp_file}")).await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;
    use crate::device::testing::{fail, ok, scripted};

    #[test]
    fn package_from_path() {
        assert_eq!(Some("com.example"), package_of("/data/data/com.example/databases/x.db"));
        assert_eq!(Some("com.example"), package_of("/data/user/0/com.example/files"));
        assert_eq!(None, package_of("/data/user/0"));
        assert_eq!(None, package_of("/sdcard/Download/x.txt"));
        assert_eq!(None, package_of(""));
    }

    #[test]
    fn root_required_outside_shared_dirs() {
        assert!(root_required("/data/system/packages.xml"));
        assert!(!root_required("/data/local/tmp/x"));
        assert!(!root_required("/sdcard/DCIM"));
        assert!(!root_required(""));
    }

    #[test]
    fn prefixes_in_order() {
        assert_eq!(
            vec!["run-as com.example ", "su root ", ""],
            access_prefixes(Some("/data/data/com.example/files/a"))
        );
        assert_eq!(vec![""], access_prefixes(Some("/sdcard/a")));
        assert_eq!(vec![""], access_prefixes(None));
    }

    #[tokio::test]
    async fn trusted_exit_code_stops_at_first_success() {
        let (device, runner) = scripted(|cmd| match cmd {
            "shell getprop ro.build.version.sdk" => ok("30"),
            "shell run-as com.example cat /data/data/com.example/files/a" => ok("hello"),
            _ => fail(1, ""),
        });
        cat_file(&device, "/data/data/com.example/files/a").await.unwrap();
        assert_eq!(
            vec![
                "shell run-as com.example cat /data/data/com.example/files/a",
                "shell getprop ro.build.version.sdk",
            ],
            runner.calls()
        );
    }

    #[tokio::test]
    async fn untrusted_exit_code_tries_every_prefix() {
        let (device, runner) = scripted(|cmd| match cmd {
            "shell getprop ro.build.version.sdk" => ok("22"),
            _ => ok("content"),
        });
        let stdout = execute_file_command(
            &device,
            "cat /data/data/com.example/files/a",
            Some("/data/data/com.example/files/a"),
        )
        .await
        .unwrap();
        assert_eq!(Some("content".to_owned()), stdout);
        let attempts: Vec<_> = runner
            .calls()
            .into_iter()
            .filter(|c| c.ends_with("cat /data/data/com.example/files/a"))
            .collect();
        assert_eq!(3, attempts.len());
    }

    #[tokio::test]
    async fn missing_file_stops_immediately() {
        let (device, runner) = scripted(|_| {
            fail(1, "rm: /data/data/com.example/a: No such file or directory")
        });
        let err = delete_file(&device, "/data/data/com.example/a", false, false)
            .await
            .unwrap_err();
        assert_eq!("File not found: /data/data/com.example/a", err.to_string());
        assert_eq!(1, runner.calls().len());
    }

    #[tokio::test]
    async fn tmp_file_name_is_regenerated_on_collision() {
        let probes = Arc::new(AtomicUsize::new(0));
        let counter = probes.clone();
        let (device, runner) = scripted(move |cmd| {
            if cmd.starts_with("shell \"ls /data/local/tmp/screenshot-") {
                // Only the first name is taken.
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    return ok("exists");
                }
                return ok("");
            }
            match cmd {
                "shell getprop ro.build.version.sdk" => ok("30"),
                _ => ok(""),
            }
        });
        let path = create_tmp_file(&device, "screenshot", "png").await.unwrap();
        assert!(path.starts_with("/data/local/tmp/screenshot-"));
        assert!(path.ends_with(".png"));
        assert_eq!(2, probes.load(Ordering::SeqCst));
        let calls = runner.calls();
        assert!(calls.contains(&format!("shell touch {path}")));
        assert_eq!(Some(&format!("shell chmod 666 {path}")), calls.last());
    }

    #[tokio::test]
    async fn tmp_file_rejects_slash() {
        let (device, runner) = scripted(|_| ok(""));
        let err = create_tmp_file(&device, "a/b", "tmp").await.unwrap_err();
        assert!(matches!(err, CliError::InvalidArgument(_)));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn move_between_packages_is_refused() {
        let (device, runner) = scripted(|_| ok(""));
        assert!(move_file(
            &device,
            "/data/data/com.example.a/files/x",
            "/data/data/com.example.b/files/x",
            false
        )
        .await
        .is_err());
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn push_refuses_directories() {
        let dir = tempfile::tempdir().unwrap();
        let (device, runner) = scripted(|_| ok(""));
        let err = push_file(&device, &dir.path().display().to_string(), "/sdcard/x")
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("This tool does not support pushing a directory"));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn pull_reports_sqlite_companions() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("app.db");
        std::fs::write(&local, b"SQLite format 3\0").unwrap();
        let local = local.display().to_string();
        let (device, runner) = scripted(|cmd| match cmd {
            "shell getprop ro.build.version.sdk" => ok("30"),
            "shell \"ls /sdcard/app.db 1>/dev/null 2>/dev/null && echo exists\"" => ok("exists"),
            "shell \"ls /sdcard/app.db-wal 1>/dev/null 2>/dev/null && echo exists\"" => {
                ok("exists")
            }
            _ => ok(""),
        });
        pull_file(&device, "/sdcard/app.db", Some(&local), false)
            .await
            .unwrap();
        let pulls: Vec<_> = runner
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("pull "))
            .collect();
        assert_eq!(vec![format!("pull /sdcard/app.db \"{local}\"")], pulls);
    }
}
