//! Filtering of stored patch selections and options against the bundles
//! that are currently available, plus the small edit helpers used by the
//! expert-mode and repatch dialogs.

use std::collections::{BTreeMap, BTreeSet};

use crate::model::{BundleId, OptionValue, Options, PatchInfo, PatchSelection, ScopedBundles};

const GMS_CORE_SUPPORT_PATCH: &str = "GmsCore support";

/// Restricts `selection` to patches that exist in `bundles`.
///
/// A bundle missing from `bundles` keeps its patches untouched so applied
/// patches stay visible while their source is unavailable. If filtering a
/// known bundle would leave it empty, its original set is kept for the same
/// reason.
pub fn sanitize_selection(selection: &PatchSelection, bundles: &ScopedBundles) -> PatchSelection {
    let mut out = PatchSelection::new();
    for (uid, patches) in selection {
        if patches.is_empty() {
            continue;
        }
        let Some(bundle) = bundles.get(uid) else {
            out.insert(*uid, patches.clone());
            continue;
        };

        let kept: BTreeSet<String> = patches
            .iter()
            .filter(|name| bundle.patch(name).is_some())
            .cloned()
            .collect();
        if kept.is_empty() {
            out.insert(*uid, patches.clone());
        } else {
            out.insert(*uid, kept);
        }
    }
    out
}

/// Drops options whose bundle, patch or key no longer exists, and values
/// whose type does not match the declared option. Returns the cleaned
/// options and the number of values removed.
pub fn sanitize_options(options: &Options, bundles: &ScopedBundles) -> (Options, usize) {
    let mut out = Options::new();
    let mut rejected = 0usize;

    for (uid, patch_options) in options {
        let Some(bundle) = bundles.get(uid) else {
            rejected += count_values(patch_options);
            continue;
        };

        let mut filtered = BTreeMap::new();
        for (patch_name, values) in patch_options {
            let Some(patch) = bundle.patch(patch_name) else {
                rejected += values.len();
                continue;
            };
            let kept: BTreeMap<String, OptionValue> = values
                .iter()
                .filter(|(key, value)| {
                    patch
                        .option_schema(key)
                        .is_some_and(|schema| value.matches(schema.kind))
                })
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            rejected += values.len() - kept.len();
            if !kept.is_empty() {
                filtered.insert(patch_name.clone(), kept);
            }
        }
        if !filtered.is_empty() {
            out.insert(*uid, filtered);
        }
    }

    (out, rejected)
}

fn count_values(patch_options: &BTreeMap<String, BTreeMap<String, OptionValue>>) -> usize {
    patch_options.values().map(BTreeMap::len).sum()
}

/// Requested patch names that did not survive sanitizing, sorted and
/// distinct.
pub fn missing_patches(requested: &PatchSelection, sanitized: &PatchSelection) -> Vec<String> {
    let mut missing = BTreeSet::new();
    for (uid, patches) in requested {
        let kept = sanitized.get(uid);
        for name in patches {
            if !kept.is_some_and(|kept| kept.contains(name)) {
                missing.insert(name.clone());
            }
        }
    }
    missing.into_iter().collect()
}

pub fn count_patches(selection: &PatchSelection) -> usize {
    selection.values().map(BTreeSet::len).sum()
}

pub fn prune_selection(selection: &mut PatchSelection) {
    selection.retain(|_, patches| !patches.is_empty());
}

pub fn prune_options(options: &mut Options) {
    for patch_options in options.values_mut() {
        patch_options.retain(|_, values| !values.is_empty());
    }
    options.retain(|_, patch_options| !patch_options.is_empty());
}

/// Flips `patch_name` in an already selected bundle. Unselected bundles are
/// left alone.
pub fn toggle_patch(selection: &mut PatchSelection, uid: BundleId, patch_name: &str) {
    let Some(patches) = selection.get_mut(&uid) else {
        return;
    };
    if !patches.remove(patch_name) {
        patches.insert(patch_name.to_string());
    }
    if patches.is_empty() {
        selection.remove(&uid);
    }
}

/// Sets or, with `None`, clears one option value.
pub fn set_option(
    options: &mut Options,
    uid: BundleId,
    patch_name: &str,
    key: &str,
    value: Option<OptionValue>,
) {
    let patch_options = options
        .entry(uid)
        .or_default()
        .entry(patch_name.to_string())
        .or_default();
    match value {
        Some(value) => {
            patch_options.insert(key.to_string(), value);
        }
        None => {
            patch_options.remove(key);
        }
    }
    prune_options(options);
}

pub fn reset_patch_options(options: &mut Options, uid: BundleId, patch_name: &str) {
    let Some(bundle_options) = options.get_mut(&uid) else {
        return;
    };
    bundle_options.remove(patch_name);
    if bundle_options.is_empty() {
        options.remove(&uid);
    }
}

/// Default inclusion rule: the bundle's own `include` flag, minus the GmsCore
/// patch when installing through a mount.
pub fn default_patch_filter(use_mount_install: bool) -> impl Fn(BundleId, &PatchInfo) -> bool {
    move |_, patch| {
        patch.include
            && !(use_mount_install && patch.name.eq_ignore_ascii_case(GMS_CORE_SUPPORT_PATCH))
    }
}

/// Default selection over every enabled bundle.
pub fn default_selection<F>(
    bundles: &ScopedBundles,
    package_name: &str,
    version: Option<&str>,
    allow_incompatible: bool,
    filter: F,
) -> PatchSelection
where
    F: Fn(BundleId, &PatchInfo) -> bool,
{
    let mut out = PatchSelection::new();
    for bundle in bundles.values().filter(|bundle| bundle.enabled) {
        let names: BTreeSet<String> = bundle
            .patch_sequence(package_name, version, allow_incompatible)
            .filter(|patch| filter(bundle.uid, patch))
            .map(|patch| patch.name.clone())
            .collect();
        if !names.is_empty() {
            out.insert(bundle.uid, names);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{bundle, patch, patch_with_options, scoped};
    use crate::model::OptionKind;

    fn sel(entries: &[(BundleId, &[&str])]) -> PatchSelection {
        entries
            .iter()
            .map(|(uid, names)| (*uid, names.iter().map(|n| n.to_string()).collect()))
            .collect()
    }

    #[test]
    fn drops_patches_missing_from_known_bundle() {
        let bundles = scoped(vec![bundle(1, vec![patch("a")])]);
        let out = sanitize_selection(&sel(&[(1, &["a", "b"])]), &bundles);
        assert_eq!(out, sel(&[(1, &["a"])]));
    }

    #[test]
    fn keeps_bundles_missing_from_scope() {
        let bundles = scoped(vec![bundle(1, vec![patch("a")])]);
        let out = sanitize_selection(&sel(&[(2, &["x"])]), &bundles);
        assert_eq!(out, sel(&[(2, &["x"])]));
    }

    #[test]
    fn keeps_original_set_when_filter_empties_bundle() {
        let bundles = scoped(vec![bundle(1, vec![patch("a")])]);
        let out = sanitize_selection(&sel(&[(1, &["y", "z"])]), &bundles);
        assert_eq!(out, sel(&[(1, &["y", "z"])]));
    }

    #[test]
    fn sanitize_is_idempotent_and_never_adds_names() {
        let bundles = scoped(vec![
            bundle(1, vec![patch("a"), patch("b")]),
            bundle(3, vec![patch("c")]),
        ]);
        let inputs = [
            sel(&[(1, &["a", "b", "q"]), (2, &["x"]), (3, &["c", "d"])]),
            sel(&[(1, &["q"]), (3, &[])]),
            sel(&[]),
            sel(&[(2, &["x", "y"]), (3, &["d"])]),
        ];
        for input in inputs {
            let once = sanitize_selection(&input, &bundles);
            let twice = sanitize_selection(&once, &bundles);
            assert_eq!(once, twice);
            for (uid, names) in &once {
                let requested = &input[uid];
                assert!(names.is_subset(requested));
                if let Some(bundle) = bundles.get(uid) {
                    let all_valid = names.iter().all(|n| bundle.patch(n).is_some());
                    assert!(all_valid || names == requested);
                }
            }
        }
    }

    #[test]
    fn options_keep_only_declared_keys_with_matching_types() {
        let bundles = scoped(vec![bundle(
            1,
            vec![
                patch_with_options("theme", &[("color", OptionKind::String)]),
                patch_with_options("icon", &[("folder", OptionKind::Path)]),
                patch("plain"),
            ],
        )]);
        let mut options = Options::new();
        set_option(&mut options, 1, "theme", "color", Some(OptionValue::String("#000".into())));
        set_option(&mut options, 1, "theme", "stale", Some(OptionValue::Bool(true)));
        set_option(&mut options, 1, "icon", "folder", Some(OptionValue::Int(4)));
        set_option(&mut options, 1, "plain", "anything", Some(OptionValue::Int(1)));
        set_option(&mut options, 1, "gone", "k", Some(OptionValue::Int(1)));
        set_option(&mut options, 7, "p", "k", Some(OptionValue::Int(1)));

        let (out, rejected) = sanitize_options(&options, &bundles);
        assert_eq!(rejected, 5);
        assert_eq!(out.len(), 1);
        assert_eq!(out[&1].len(), 1);
        assert_eq!(out[&1]["theme"]["color"], OptionValue::String("#000".into()));

        for (uid, patches) in &out {
            for (name, values) in patches {
                let patch = bundles[uid].patch(name).unwrap();
                for key in values.keys() {
                    assert!(patch.option_schema(key).is_some());
                }
            }
        }
    }

    #[test]
    fn missing_patches_are_sorted_and_distinct() {
        let requested = sel(&[(1, &["b", "a", "z"]), (2, &["z", "m"])]);
        let sanitized = sel(&[(1, &["a"]), (2, &["m"])]);
        assert_eq!(missing_patches(&requested, &sanitized), vec!["b", "z"]);
    }

    #[test]
    fn toggle_prunes_emptied_bundle() {
        let mut selection = sel(&[(1, &["a"])]);
        toggle_patch(&mut selection, 1, "b");
        assert_eq!(selection, sel(&[(1, &["a", "b"])]));
        toggle_patch(&mut selection, 1, "a");
        toggle_patch(&mut selection, 1, "b");
        assert!(selection.is_empty());
        toggle_patch(&mut selection, 5, "x");
        assert!(selection.is_empty());
    }

    #[test]
    fn clearing_last_option_prunes_containers() {
        let mut options = Options::new();
        set_option(&mut options, 1, "p", "k", Some(OptionValue::Bool(true)));
        set_option(&mut options, 1, "p", "k", None);
        assert!(options.is_empty());

        set_option(&mut options, 1, "p", "k", Some(OptionValue::Bool(true)));
        reset_patch_options(&mut options, 1, "p");
        assert!(options.is_empty());
    }

    #[test]
    fn default_selection_skips_gms_core_under_mount() {
        let mut excluded = patch("Hidden");
        excluded.include = false;
        let mut disabled = bundle(2, vec![patch("other")]);
        disabled.enabled = false;
        let bundles = scoped(vec![
            bundle(0, vec![patch("GmsCore support"), patch("Theme"), excluded]),
            disabled,
        ]);

        let rooted = default_selection(&bundles, "com.example", None, false, default_patch_filter(true));
        assert_eq!(rooted, sel(&[(0, &["Theme"])]));

        let plain = default_selection(&bundles, "com.example", None, false, default_patch_filter(false));
        assert_eq!(plain, sel(&[(0, &["GmsCore support", "Theme"])]));
    }
}
