use std::collections::BTreeMap;

use skyhook_crd::{BUILD_VERSION, Package, PackageState};

/// One ordered migration step: rewrites persisted per-node state so it
/// matches what the current build expects (§4.8). Kept as plain
/// functions over `&mut BTreeMap<String, PackageState>` rather than a
/// trait object — there is no dynamic dispatch need here, only an
/// ordered list run in sequence.
pub struct Migrator {
    pub to_version: &'static str,
    pub run: fn(&mut BTreeMap<String, PackageState>, &BTreeMap<String, Package>),
}

/// Ordered oldest-first; every migrator whose `to_version` is newer than
/// the recorded version runs, in order.
pub const MIGRATORS: &[Migrator] = &[Migrator {
    to_version: "0.5.0",
    run: migrate_node_to_0_5_0,
}];

/// Backfills `image` for any entry an older build left blank, and prunes
/// entries for packages no longer named in `MIGRATIONS`' source spec
/// (stale unversioned entries from before `packageKey` included a
/// version).
fn migrate_node_to_0_5_0(state: &mut BTreeMap<String, PackageState>, packages: &BTreeMap<String, Package>) {
    state.retain(|key, _| skyhook_crd::split_package_key(key).is_some());
    for (key, entry) in state.iter_mut() {
        if entry.image.is_empty()
            && let Some((name, _version)) = skyhook_crd::split_package_key(key)
            && let Some(pkg) = packages.get(name)
        {
            entry.image = pkg.image.clone();
        }
    }
}

/// Whether migration should run at all: no recorded version, or one
/// older than the running build, by semver ordering (§4.8). A recorded
/// version that is newer (or unparseable) never re-triggers migration —
/// only "less" does.
pub fn needs_migration(recorded_version: Option<&str>) -> bool {
    match recorded_version {
        None => true,
        Some(v) => match semver::Version::parse(v) {
            Ok(recorded) => recorded < semver::Version::parse(BUILD_VERSION).expect("BUILD_VERSION is valid semver"),
            Err(_) => true,
        },
    }
}

/// Runs every migrator in order against `state`, mutating it in place.
/// Returns the version to stamp back (always the current build). A
/// migrator is expected to be idempotent against already-migrated state
/// so re-running on a version string that didn't parse cleanly is safe.
pub fn migrate(state: &mut BTreeMap<String, PackageState>, packages: &BTreeMap<String, Package>) -> &'static str {
    for migrator in MIGRATORS {
        (migrator.run)(state, packages);
    }
    BUILD_VERSION
}
