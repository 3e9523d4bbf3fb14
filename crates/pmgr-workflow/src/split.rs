use std::{fs::File, path::Path};

const SPLIT_EXTENSIONS: [&str; 3] = ["apks", "apkm", "xapk"];

/// True for multi-APK containers that must be merged before patching.
pub fn is_split_archive(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    if extension
        .as_deref()
        .is_some_and(|ext| SPLIT_EXTENSIONS.contains(&ext))
    {
        return true;
    }
    has_embedded_apk_entries(path)
}

fn has_embedded_apk_entries(path: &Path) -> bool {
    let Ok(file) = File::open(path) else {
        return false;
    };
    let Ok(archive) = zip::ZipArchive::new(file) else {
        return false;
    };
    let found = archive
        .file_names()
        .any(|name| !name.ends_with('/') && name.to_ascii_lowercase().ends_with(".apk"));
    found
}
