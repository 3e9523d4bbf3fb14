use std::{
    io,
    path::{Path, PathBuf},
    process::{Output, Stdio},
};

use futures_util::future::{BoxFuture, FutureExt};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::model::PackageInfo;

pub const AAPT2_PATH_ENV: &str = "PMGR_AAPT2_PATH";
pub const ADB_PATH_ENV: &str = "PMGR_ADB_PATH";

#[derive(Debug, Error)]
pub enum InspectError {
    #[error("{0} not found (set {1} or ANDROID_SDK_ROOT)")]
    NotFound(&'static str, &'static str),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("{tool} failed with exit {status}: {detail}")]
    Exit {
        tool: &'static str,
        status: i32,
        detail: String,
    },
    #[error("unrecognized {0} output")]
    Parse(&'static str),
}

/// Reads package metadata from APK files and from the device.
pub trait PackageInspector: Send + Sync {
    fn inspect_file<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<PackageInfo, InspectError>>;

    /// `Ok(None)` when the package is not installed.
    fn inspect_installed<'a>(
        &'a self,
        package_name: &'a str,
    ) -> BoxFuture<'a, Result<Option<PackageInfo>, InspectError>>;

    /// Copies the installed base APK of `package_name` into `dest_dir`.
    fn pull_installed<'a>(
        &'a self,
        package_name: &'a str,
        dest_dir: &'a Path,
    ) -> BoxFuture<'a, Result<PathBuf, InspectError>>;
}

/// `aapt2` for files, `adb` for the attached device.
#[derive(Debug, Clone, Default)]
pub struct SystemInspector;

fn sdk_root() -> Option<PathBuf> {
    std::env::var("ANDROID_SDK_ROOT")
        .or_else(|_| std::env::var("ANDROID_HOME"))
        .ok()
        .map(PathBuf::from)
}

pub fn adb_path() -> PathBuf {
    if let Ok(path) = std::env::var(ADB_PATH_ENV) {
        return PathBuf::from(path);
    }
    if let Some(sdk_root) = sdk_root() {
        let candidate = sdk_root.join("platform-tools").join("adb");
        if candidate.exists() {
            return candidate;
        }
    }
    PathBuf::from("adb")
}

pub fn aapt2_path() -> PathBuf {
    if let Ok(path) = std::env::var(AAPT2_PATH_ENV) {
        return PathBuf::from(path);
    }
    if let Some(sdk_root) = sdk_root() {
        let build_tools = sdk_root.join("build-tools");
        // Highest installed build-tools version wins.
        if let Ok(entries) = std::fs::read_dir(&build_tools) {
            let mut versions: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok().map(|entry| entry.path()))
                .filter(|path| path.join("aapt2").is_file())
                .collect();
            versions.sort();
            if let Some(latest) = versions.pop() {
                return latest.join("aapt2");
            }
        }
    }
    PathBuf::from("aapt2")
}

async fn tool_output(
    tool: &'static str,
    env: &'static str,
    program: PathBuf,
    args: &[&str],
) -> Result<Output, InspectError> {
    let mut cmd = Command::new(program);
    cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
    let output = cmd.output().await.map_err(|err| {
        if err.kind() == io::ErrorKind::NotFound {
            InspectError::NotFound(tool, env)
        } else {
            InspectError::Io(err)
        }
    })?;

    if output.status.success() {
        Ok(output)
    } else {
        Err(InspectError::Exit {
            tool,
            status: output.status.code().unwrap_or(-1),
            detail: format_tool_output(
                &String::from_utf8_lossy(&output.stdout),
                &String::from_utf8_lossy(&output.stderr),
            ),
        })
    }
}

async fn adb(args: &[&str]) -> Result<String, InspectError> {
    let output = tool_output("adb", ADB_PATH_ENV, adb_path(), args).await?;
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

pub(crate) fn format_tool_output(stdout: &str, stderr: &str) -> String {
    let stdout = stdout.trim();
    let stderr = stderr.trim();
    let mut out = String::new();

    if !stdout.is_empty() {
        out.push_str("stdout:\n");
        out.push_str(stdout);
        out.push('\n');
    }
    if !stderr.is_empty() {
        out.push_str("stderr:\n");
        out.push_str(stderr);
        out.push('\n');
    }

    out.trim().to_string()
}

impl PackageInspector for SystemInspector {
    fn inspect_file<'a>(&'a self, path: &'a Path) -> BoxFuture<'a, Result<PackageInfo, InspectError>> {
        async move {
            let path_str = path.to_string_lossy();
            let output = tool_output(
                "aapt2",
                AAPT2_PATH_ENV,
                aapt2_path(),
                &["dump", "badging", path_str.as_ref()],
            )
            .await?;
            parse_badging(&String::from_utf8_lossy(&output.stdout)).ok_or(InspectError::Parse("aapt2"))
        }
        .boxed()
    }

    fn inspect_installed<'a>(
        &'a self,
        package_name: &'a str,
    ) -> BoxFuture<'a, Result<Option<PackageInfo>, InspectError>> {
        async move {
            let dump = adb(&["shell", "dumpsys", "package", package_name]).await?;
            Ok(parse_dumpsys_package(package_name, &dump))
        }
        .boxed()
    }

    fn pull_installed<'a>(
        &'a self,
        package_name: &'a str,
        dest_dir: &'a Path,
    ) -> BoxFuture<'a, Result<PathBuf, InspectError>> {
        async move {
            let listing = adb(&["shell", "pm", "path", package_name]).await?;
            let remote = parse_base_apk_path(&listing).ok_or(InspectError::Parse("pm path"))?;
            let local = dest_dir.join(format!("{}.apk", pmgr_util::sanitize_filename(package_name)));
            let local_str = local.to_string_lossy();
            adb(&["pull", remote.as_str(), local_str.as_ref()]).await?;
            debug!("Pulled {remote} to {}", local.display());
            Ok(local)
        }
        .boxed()
    }
}

fn quoted_attr(line: &str, key: &str) -> Option<String> {
    let marker = format!("{key}='");
    let start = line.find(&marker)? + marker.len();
    let end = line[start..].find('\'')? + start;
    Some(line[start..end].to_string())
}

/// Parses `aapt2 dump badging` output.
pub fn parse_badging(output: &str) -> Option<PackageInfo> {
    let package_line = output.lines().find(|line| line.starts_with("package:"))?;
    let package_name = quoted_attr(package_line, "name")?;
    let label = output
        .lines()
        .find_map(|line| line.strip_prefix("application-label:"))
        .map(|label| label.trim().trim_matches('\'').to_string())
        .filter(|label| !label.is_empty());

    Some(PackageInfo {
        package_name,
        version_name: quoted_attr(package_line, "versionName"),
        version_code: quoted_attr(package_line, "versionCode").and_then(|code| code.parse().ok()),
        label,
        last_update: None,
    })
}

/// Parses `dumpsys package <name>`; `None` when the package is absent.
pub fn parse_dumpsys_package(package_name: &str, output: &str) -> Option<PackageInfo> {
    let header = format!("Package [{package_name}]");
    let section = &output[output.find(&header)?..];

    let mut info = PackageInfo {
        package_name: package_name.to_string(),
        ..PackageInfo::default()
    };
    for line in section.lines().map(str::trim) {
        if let Some(value) = line.strip_prefix("versionName=") {
            info.version_name.get_or_insert_with(|| value.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("versionCode=") {
            let code = rest.split_whitespace().next().and_then(|code| code.parse().ok());
            if info.version_code.is_none() {
                info.version_code = code;
            }
        } else if let Some(value) = line.strip_prefix("lastUpdateTime=") {
            info.last_update.get_or_insert_with(|| value.trim().to_string());
        }
    }
    Some(info)
}

fn parse_base_apk_path(output: &str) -> Option<String> {
    let paths: Vec<&str> = output
        .lines()
        .filter_map(|line| line.trim().strip_prefix("package:"))
        .collect();
    paths
        .iter()
        .find(|path| path.ends_with("/base.apk"))
        .or_else(|| paths.first())
        .map(|path| path.to_string())
}
