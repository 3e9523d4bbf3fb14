use chrono::{DateTime, Local};
use pmgr_util::sanitize_filename;

pub const DEFAULT_TEMPLATE: &str = "{app name}-{app version}-{patches version}.apk";

/// Display data of a patched artifact, derived from its manifest and the
/// applied selection.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchedAppExportData {
    pub app_name: Option<String>,
    pub package_name: String,
    pub app_version: Option<String>,
    pub bundle_versions: Vec<String>,
    pub bundle_names: Vec<String>,
    pub generated_at: DateTime<Local>,
    pub manager_version: String,
}

impl PatchedAppExportData {
    pub fn new(package_name: impl Into<String>) -> Self {
        Self {
            app_name: None,
            package_name: package_name.into(),
            app_version: None,
            bundle_versions: Vec::new(),
            bundle_names: Vec::new(),
            generated_at: Local::now(),
            manager_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Renders export file names from a template such as
/// `{app name}-{app version}-{patches version}.apk`.
pub struct ExportNameFormatter;

impl ExportNameFormatter {
    pub fn format(template: Option<&str>, data: &PatchedAppExportData) -> String {
        let template = template
            .filter(|template| !template.trim().is_empty())
            .unwrap_or(DEFAULT_TEMPLATE);
        let rendered = ensure_extension(replace_variables(template, data));
        let trimmed = rendered.trim();
        let clean = if trimmed.is_empty() {
            DEFAULT_TEMPLATE
        } else {
            trimmed
        };
        sanitize_filename(clean)
    }
}

fn replace_variables(template: &str, data: &PatchedAppExportData) -> String {
    let app_name = data
        .app_name
        .as_deref()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or(&data.package_name)
        .to_string();
    let versions: Vec<String> = data
        .bundle_versions
        .iter()
        .filter_map(|version| format_version(version))
        .collect();
    let manager_version = if data.manager_version.trim().is_empty() {
        "unknown".to_string()
    } else {
        data.manager_version.clone()
    };

    let replacements = [
        ("{app name}", app_name),
        ("{package name}", data.package_name.clone()),
        (
            "{app version}",
            data.app_version
                .as_deref()
                .and_then(format_version)
                .unwrap_or_else(|| "unknown".to_string()),
        ),
        ("{patches version}", join_values(&versions, "unknown", 1, "+")),
        ("{patch bundle names}", join_values(&data.bundle_names, "bundles", 2, "_")),
        ("{manager version}", manager_version),
        ("{timestamp}", data.generated_at.format("%Y%m%d-%H%M%S").to_string()),
        ("{date}", data.generated_at.format("%Y%m%d").to_string()),
    ];

    replacements
        .iter()
        .fold(template.to_string(), |acc, (token, value)| acc.replace(token, value))
}

fn format_version(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let normalized = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    Some(format!("v{normalized}"))
}

fn join_values(values: &[String], fallback: &str, limit: usize, separator: &str) -> String {
    let mut distinct: Vec<&str> = Vec::new();
    for value in values.iter().map(|value| value.trim()) {
        if !value.is_empty() && !distinct.contains(&value) {
            distinct.push(value);
        }
    }
    if distinct.is_empty() {
        return fallback.to_string();
    }
    distinct.truncate(limit);
    distinct.join(separator)
}

fn ensure_extension(value: String) -> String {
    if value.to_ascii_lowercase().ends_with(".apk") {
        value
    } else {
        format!("{value}.apk")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn data() -> PatchedAppExportData {
        PatchedAppExportData {
            app_name: Some("YouTube".into()),
            package_name: "com.google.android.youtube".into(),
            app_version: Some("19.16.39".into()),
            bundle_versions: vec![" ".into(), "V1.2.0".into(), "1.3.0".into()],
            bundle_names: vec!["Default".into(), "Default".into(), "Extra".into(), "Third".into()],
            generated_at: Local.with_ymd_and_hms(2024, 5, 1, 13, 4, 5).unwrap(),
            manager_version: "1.0.0".into(),
        }
    }

    #[test]
    fn default_template_uses_name_and_versions() {
        assert_eq!(
            ExportNameFormatter::format(None, &data()),
            "YouTube-v19.16.39-v1.2.0.apk"
        );
        assert_eq!(
            ExportNameFormatter::format(Some("  "), &data()),
            "YouTube-v19.16.39-v1.2.0.apk"
        );
    }

    #[test]
    fn every_variable_is_substituted() {
        let name = ExportNameFormatter::format(
            Some("{package name}_{patch bundle names}_{manager version}_{date}_{timestamp}"),
            &data(),
        );
        assert_eq!(
            name,
            "com.google.android.youtube_Default_Extra_1.0.0_20240501_20240501-130405.apk"
        );
    }

    #[test]
    fn missing_values_fall_back() {
        let mut bare = data();
        bare.app_name = Some(" ".into());
        bare.app_version = None;
        bare.bundle_versions.clear();
        bare.bundle_names.clear();
        assert_eq!(
            ExportNameFormatter::format(Some("{app name} {app version} {patches version} {patch bundle names}.APK"), &bare),
            "com.google.android.youtube_unknown_unknown_bundles.APK"
        );
    }
}
