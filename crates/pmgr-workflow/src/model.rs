use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
};

use serde::{Deserialize, Serialize};

pub type BundleId = i32;

/// Bundle uid of the built-in patch source.
pub const DEFAULT_SOURCE_UID: BundleId = 0;

/// Patch names chosen per bundle. Bundles with an empty set are never stored.
pub type PatchSelection = BTreeMap<BundleId, BTreeSet<String>>;

/// Option values keyed by bundle, then patch name, then option key.
pub type Options = BTreeMap<BundleId, BTreeMap<String, BTreeMap<String, OptionValue>>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum OptionValue {
    String(String),
    Bool(bool),
    Int(i64),
    Float(f64),
    StringList(Vec<String>),
    Path(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionKind {
    String,
    Bool,
    Int,
    Float,
    StringList,
    Path,
}

impl OptionValue {
    pub fn kind(&self) -> OptionKind {
        match self {
            OptionValue::String(_) => OptionKind::String,
            OptionValue::Bool(_) => OptionKind::Bool,
            OptionValue::Int(_) => OptionKind::Int,
            OptionValue::Float(_) => OptionKind::Float,
            OptionValue::StringList(_) => OptionKind::StringList,
            OptionValue::Path(_) => OptionKind::Path,
        }
    }

    /// Whether this value may be stored under an option declared as `kind`.
    /// A path option accepts a plain string, which is how pickers hand them
    /// over.
    pub fn matches(&self, kind: OptionKind) -> bool {
        match (self, kind) {
            (OptionValue::String(_), OptionKind::Path) => true,
            _ => self.kind() == kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionSchema {
    pub key: String,
    pub kind: OptionKind,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompatiblePackage {
    pub package_name: String,
    /// `None` means every version.
    #[serde(default)]
    pub versions: Option<BTreeSet<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub include: bool,
    /// `None` means the patch applies to any package.
    #[serde(default)]
    pub compatible_packages: Option<Vec<CompatiblePackage>>,
    /// `None` means the patch does not declare an option schema.
    #[serde(default)]
    pub options: Option<Vec<OptionSchema>>,
}

fn default_true() -> bool {
    true
}

impl PatchInfo {
    pub fn option_schema(&self, key: &str) -> Option<&OptionSchema> {
        self.options
            .as_ref()
            .and_then(|schema| schema.iter().find(|option| option.key == key))
    }

    pub fn supports(&self, package_name: &str, version: Option<&str>) -> bool {
        let Some(packages) = &self.compatible_packages else {
            return true;
        };
        packages.iter().any(|pkg| {
            pkg.package_name == package_name
                && match (&pkg.versions, version) {
                    (None, _) | (_, None) => true,
                    (Some(versions), Some(version)) => {
                        versions.is_empty() || versions.contains(version)
                    }
                }
        })
    }
}

/// A bundle narrowed to one target package and version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopedBundle {
    pub uid: BundleId,
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub patches: Vec<PatchInfo>,
}

impl ScopedBundle {
    pub fn patch(&self, name: &str) -> Option<&PatchInfo> {
        self.patches.iter().find(|patch| patch.name == name)
    }

    /// Patches usable for `package_name`/`version`, or all of them when
    /// incompatible patches are allowed.
    pub fn patch_sequence<'a>(
        &'a self,
        package_name: &'a str,
        version: Option<&'a str>,
        allow_incompatible: bool,
    ) -> impl Iterator<Item = &'a PatchInfo> + 'a {
        self.patches
            .iter()
            .filter(move |patch| allow_incompatible || patch.supports(package_name, version))
    }
}

pub type ScopedBundles = BTreeMap<BundleId, ScopedBundle>;

/// Global, package independent view of a bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleInfo {
    pub uid: BundleId,
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub patches: Vec<PatchInfo>,
}

impl BundleInfo {
    pub fn title(&self) -> &str {
        self.display_name
            .as_deref()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(&self.name)
    }
}

impl From<&BundleInfo> for ScopedBundle {
    fn from(info: &BundleInfo) -> Self {
        Self {
            uid: info.uid,
            name: info.name.clone(),
            version: info.version.clone(),
            enabled: info.enabled,
            patches: info.patches.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SelectedApp {
    Local {
        package_name: String,
        version: Option<String>,
        file: PathBuf,
        /// Deleted when the workflow ends.
        temporary: bool,
        #[serde(default)]
        resolved: bool,
    },
    Installed {
        package_name: String,
        version: Option<String>,
    },
    Download {
        package_name: String,
        version: Option<String>,
        url: String,
    },
    Search {
        package_name: String,
        version: Option<String>,
    },
}

impl SelectedApp {
    pub fn package_name(&self) -> &str {
        match self {
            SelectedApp::Local { package_name, .. }
            | SelectedApp::Installed { package_name, .. }
            | SelectedApp::Download { package_name, .. }
            | SelectedApp::Search { package_name, .. } => package_name,
        }
    }

    pub fn version(&self) -> Option<&str> {
        match self {
            SelectedApp::Local { version, .. }
            | SelectedApp::Installed { version, .. }
            | SelectedApp::Download { version, .. }
            | SelectedApp::Search { version, .. } => version.as_deref(),
        }
    }

    pub fn needs_download(&self) -> bool {
        matches!(self, SelectedApp::Download { .. } | SelectedApp::Search { .. })
    }

    pub fn is_temporary_local(&self) -> bool {
        matches!(self, SelectedApp::Local { temporary: true, .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallType {
    Default,
    Custom,
    Mount,
    /// Kept only as a saved copy; the copy is the product.
    Saved,
    Shizuku,
}

/// Package metadata read from an APK or an installed package.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PackageInfo {
    pub package_name: String,
    #[serde(default)]
    pub version_name: Option<String>,
    #[serde(default)]
    pub version_code: Option<i64>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub last_update: Option<String>,
}

impl PackageInfo {
    pub fn version(&self) -> Option<&str> {
        self.version_name
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SelectionPayload {
    pub bundles: Vec<BundleSelection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleSelection {
    pub bundle_uid: BundleId,
    pub patches: Vec<String>,
    #[serde(default)]
    pub options: BTreeMap<String, BTreeMap<String, String>>,
}

impl SelectionPayload {
    pub fn to_selection(&self) -> PatchSelection {
        let mut selection = PatchSelection::new();
        for bundle in &self.bundles {
            let names: BTreeSet<String> = bundle
                .patches
                .iter()
                .filter(|name| !name.trim().is_empty())
                .cloned()
                .collect();
            if !names.is_empty() {
                selection.entry(bundle.bundle_uid).or_default().extend(names);
            }
        }
        selection
    }

    /// Keeps only bundles whose source still exists and extracts their
    /// selection.
    pub fn remap(&self, known_sources: &BTreeSet<BundleId>) -> (SelectionPayload, PatchSelection) {
        let bundles: Vec<BundleSelection> = self
            .bundles
            .iter()
            .filter(|bundle| known_sources.contains(&bundle.bundle_uid))
            .cloned()
            .collect();
        let payload = SelectionPayload { bundles };
        let selection = payload.to_selection();
        (payload, selection)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledApp {
    pub current_package_name: String,
    pub original_package_name: String,
    pub version: String,
    pub install_type: InstallType,
    #[serde(default)]
    pub selection: PatchSelection,
    #[serde(default)]
    pub selection_payload: Option<SelectionPayload>,
    /// Versions of the bundles the app was patched with.
    #[serde(default)]
    pub bundle_versions: BTreeMap<BundleId, String>,
    #[serde(default)]
    pub patched_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginalApk {
    pub package_name: String,
    pub version: String,
    pub file_path: PathBuf,
    pub last_used: i64,
    pub file_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_kind_accepts_strings() {
        assert!(OptionValue::String("/sdcard/icon".into()).matches(OptionKind::Path));
        assert!(OptionValue::Path("/sdcard".into()).matches(OptionKind::Path));
        assert!(!OptionValue::Bool(true).matches(OptionKind::String));
        assert!(!OptionValue::Path("/x".into()).matches(OptionKind::String));
    }

    #[test]
    fn supports_checks_package_and_version() {
        let patch = PatchInfo {
            name: "a".into(),
            description: None,
            include: true,
            compatible_packages: Some(vec![CompatiblePackage {
                package_name: "com.example".into(),
                versions: Some(BTreeSet::from(["1.0".to_string()])),
            }]),
            options: None,
        };
        assert!(patch.supports("com.example", Some("1.0")));
        assert!(patch.supports("com.example", None));
        assert!(!patch.supports("com.example", Some("2.0")));
        assert!(!patch.supports("com.other", Some("1.0")));
    }

    #[test]
    fn payload_remap_drops_unknown_sources_and_blank_names() {
        let payload = SelectionPayload {
            bundles: vec![
                BundleSelection {
                    bundle_uid: 1,
                    patches: vec!["a".into(), " ".into()],
                    options: BTreeMap::new(),
                },
                BundleSelection {
                    bundle_uid: 9,
                    patches: vec!["z".into()],
                    options: BTreeMap::new(),
                },
            ],
        };
        let (remapped, selection) = payload.remap(&BTreeSet::from([1]));
        assert_eq!(remapped.bundles.len(), 1);
        assert_eq!(selection, PatchSelection::from([(1, BTreeSet::from(["a".to_string()]))]));
    }

    #[test]
    fn option_value_json_is_tagged() {
        let value: OptionValue = serde_json::from_str(r#"{"type":"int","value":3}"#).unwrap();
        assert_eq!(value, OptionValue::Int(3));
    }
}
