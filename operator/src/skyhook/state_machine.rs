use std::cmp::Ordering;

use semver::Version;
use skyhook_crd::{Interrupt, InterruptKind, Package, PackageState, Stage, State};

/// What the reconciler should do next for one (node, package) pair,
/// decided from the persisted [`PackageState`] plus the package's
/// current spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Nothing in the spec changed since the last complete run; no pod
    /// needs dispatching.
    Settled,
    /// First time this node has seen this package.
    Install,
    /// The node's persisted version is older than the spec's, bumped via
    /// semver comparison (§4.2, "trigger path").
    Upgrade,
    /// The package was removed from the spec (or its compartment no
    /// longer selects the node) while still present in node state.
    Uninstall,
    /// A previous stage is still running, or erroring; re-dispatch the
    /// same stage, subject to the batch scheduler's own
    /// `failureThreshold` for whether the rollout keeps retrying it
    /// (§4.4).
    Continue,
    /// Otherwise settled, but spec.md §4.2's `configUpdates` lists a
    /// changed key for this package: re-enter at `config` (and, if that
    /// key maps to a `configInterrupts` entry, `interrupt`/
    /// `post_interrupt` too).
    ConfigChange,
}

/// Decides the trigger for a (node, package) pair given its current
/// persisted entry, if any, the desired package spec (`None` when the
/// package has been deselected for this node), and the `configMap` keys
/// that changed for it since the last reconcile where every node caught
/// up (§4.2, `configUpdates`).
pub fn decide_trigger(current: Option<&PackageState>, desired: Option<&Package>, changed_keys: &[String]) -> Trigger {
    match (current, desired) {
        (None, Some(_)) => Trigger::Install,
        (Some(_), None) => Trigger::Uninstall,
        (None, None) => Trigger::Settled,
        (Some(entry), Some(pkg)) => {
            let node_version = Version::parse(&entry.version).unwrap_or_else(|_| pkg.version.clone());
            match node_version.cmp(&pkg.version) {
                Ordering::Less => Trigger::Upgrade,
                Ordering::Greater => Trigger::Uninstall,
                Ordering::Equal => {
                    if entry.state != State::Complete {
                        Trigger::Continue
                    } else if changed_keys.is_empty() {
                        Trigger::Settled
                    } else {
                        Trigger::ConfigChange
                    }
                }
            }
        }
    }
}

/// The stage sequence a trigger runs through, per §3's strict ordering.
/// `ConfigChange` additionally needs the package spec and the changed
/// keys to decide whether the interrupt pair re-runs alongside `config`.
pub fn sequence_for(trigger: &Trigger, pkg: Option<&Package>, changed_keys: &[String]) -> &'static [Stage] {
    match trigger {
        Trigger::Install => Stage::INSTALL_SEQUENCE,
        Trigger::Upgrade => Stage::UPGRADE_SEQUENCE,
        Trigger::Uninstall => Stage::UNINSTALL_SEQUENCE,
        Trigger::ConfigChange => {
            if pkg.is_some_and(|p| config_changed(p, changed_keys)) {
                Stage::CONFIG_INTERRUPT_SEQUENCE
            } else {
                Stage::CONFIG_ONLY_SEQUENCE
            }
        }
        Trigger::Continue | Trigger::Settled => &[],
    }
}

/// Given the current entry, its trigger, and the trigger's sequence, the
/// stage that should run next. `None` once the sequence is exhausted
/// (the package is fully complete for this trigger path). Any trigger
/// other than `Continue` starts its sequence fresh at `sequence[0]`,
/// regardless of whatever stage the entry was left at by a *previous*
/// trigger path — stage names are reused across sequences (e.g.
/// `PostInterrupt` ends both `INSTALL_SEQUENCE` and
/// `CONFIG_INTERRUPT_SEQUENCE`), so resuming by position would silently
/// skip the new path entirely.
pub fn next_stage(entry: Option<&PackageState>, trigger: &Trigger, sequence: &'static [Stage]) -> Option<Stage> {
    if sequence.is_empty() {
        return None;
    }
    match trigger {
        Trigger::Install | Trigger::Upgrade | Trigger::Uninstall | Trigger::ConfigChange => Some(sequence[0]),
        Trigger::Settled => None,
        Trigger::Continue => {
            let e = entry?;
            let pos = sequence.iter().position(|s| *s == e.stage)?;
            if e.state == State::Complete {
                sequence.get(pos + 1).copied()
            } else {
                Some(sequence[pos])
            }
        }
    }
}

/// Whether a package's `config` stage should be forced even though its
/// install/upgrade stages are already complete — a change to a watched
/// `configMap` key that maps to an interrupt (§4.2, "config-triggered
/// re-entry").
pub fn config_changed(pkg: &Package, changed_keys: &[String]) -> bool {
    let Some(interrupts) = &pkg.config_interrupts else {
        return false;
    };
    changed_keys.iter().any(|k| interrupts.contains_key(k))
}

/// Whether completing `a`'s interrupt also covers `b` (§4.2, "Skipped
/// packages"): both must be a `service`-kind interrupt and share at
/// least one service name. `reboot`/`restartAllServices`/`noop` never
/// elide a sibling — only an explicit overlapping service list does.
pub fn interrupts_overlap(a: &Interrupt, b: &Interrupt) -> bool {
    a.kind == InterruptKind::Service
        && b.kind == InterruptKind::Service
        && a.services.iter().any(|s| b.services.contains(s))
}

/// Applies one pod observation to a package's entry: `Complete` resets
/// restarts; any non-zero exit marks the entry `Erroring` immediately
/// and increments `restarts` for observability (§4.2). Whether the
/// rollout keeps retrying an erroring node is the batch scheduler's
/// call, governed by the strategy's `failureThreshold` (§4.4) — this
/// function only records the one pod outcome.
pub fn apply_pod_outcome(entry: &mut PackageState, succeeded: bool) {
    if succeeded {
        entry.state = State::Complete;
        entry.restarts = 0;
        return;
    }
    entry.restarts += 1;
    entry.state = State::Erroring;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn pkg(version: &str) -> Package {
        Package {
            name: "driver".to_owned(),
            version: Version::parse(version).unwrap(),
            image: "example/driver".to_owned(),
            env: None,
            config_map: None,
            config_interrupts: None,
            interrupt: None,
            depends_on: None,
            resources: None,
            graceful_shutdown: None,
            agent_image_override: None,
        }
    }

    fn entry(version: &str, stage: Stage, state: State) -> PackageState {
        PackageState {
            name: "driver".to_owned(),
            version: version.to_owned(),
            image: "example/driver".to_owned(),
            stage,
            state,
            restarts: 0,
        }
    }

    const NO_CHANGED_KEYS: &[String] = &[];

    #[test]
    fn fresh_node_triggers_install() {
        let desired = pkg("1.0.0");
        assert_eq!(decide_trigger(None, Some(&desired), NO_CHANGED_KEYS), Trigger::Install);
    }

    #[test]
    fn higher_spec_version_triggers_upgrade() {
        let current = entry("1.0.0", Stage::Apply, State::Complete);
        let desired = pkg("2.0.0");
        assert_eq!(decide_trigger(Some(&current), Some(&desired), NO_CHANGED_KEYS), Trigger::Upgrade);
    }

    #[test]
    fn lower_spec_version_triggers_uninstall() {
        let current = entry("2.0.0", Stage::Apply, State::Complete);
        let desired = pkg("1.0.0");
        assert_eq!(decide_trigger(Some(&current), Some(&desired), NO_CHANGED_KEYS), Trigger::Uninstall);
    }

    #[test]
    fn deselected_package_triggers_uninstall() {
        let current = entry("1.0.0", Stage::Apply, State::Complete);
        assert_eq!(decide_trigger(Some(&current), None, NO_CHANGED_KEYS), Trigger::Uninstall);
    }

    #[test]
    fn matching_complete_version_is_settled() {
        let current = entry("1.0.0", Stage::PostInterrupt, State::Complete);
        let desired = pkg("1.0.0");
        assert_eq!(decide_trigger(Some(&current), Some(&desired), NO_CHANGED_KEYS), Trigger::Settled);
    }

    #[test]
    fn matching_in_progress_version_continues() {
        let current = entry("1.0.0", Stage::Apply, State::InProgress);
        let desired = pkg("1.0.0");
        assert_eq!(decide_trigger(Some(&current), Some(&desired), NO_CHANGED_KEYS), Trigger::Continue);
    }

    #[test]
    fn changed_config_key_on_complete_package_triggers_config_change() {
        let current = entry("1.0.0", Stage::PostInterrupt, State::Complete);
        let desired = pkg("1.0.0");
        let changed = vec!["driver.conf".to_owned()];
        assert_eq!(decide_trigger(Some(&current), Some(&desired), &changed), Trigger::ConfigChange);
    }

    #[test]
    fn next_stage_walks_install_sequence_in_order() {
        let seq = Stage::INSTALL_SEQUENCE;
        assert_eq!(next_stage(None, &Trigger::Install, seq), Some(Stage::Apply));
        let apply_in_progress = entry("1.0.0", Stage::Apply, State::InProgress);
        assert_eq!(next_stage(Some(&apply_in_progress), &Trigger::Continue, seq), Some(Stage::Apply));
        let apply_complete = entry("1.0.0", Stage::Apply, State::Complete);
        assert_eq!(next_stage(Some(&apply_complete), &Trigger::Continue, seq), Some(Stage::Config));
        let post_interrupt_complete = entry("1.0.0", Stage::PostInterrupt, State::Complete);
        assert_eq!(next_stage(Some(&post_interrupt_complete), &Trigger::Continue, seq), None);
    }

    #[test]
    fn config_change_restarts_at_sequence_head_even_if_old_stage_matches_tail() {
        // A package that finished a full install sits at PostInterrupt,
        // Complete. A config-only trigger must still start at Config,
        // not treat PostInterrupt's position in CONFIG_ONLY_SEQUENCE as
        // "already past the end" (it isn't even in that sequence).
        let settled = entry("1.0.0", Stage::PostInterrupt, State::Complete);
        assert_eq!(
            next_stage(Some(&settled), &Trigger::ConfigChange, Stage::CONFIG_ONLY_SEQUENCE),
            Some(Stage::Config)
        );
        assert_eq!(
            next_stage(Some(&settled), &Trigger::ConfigChange, Stage::CONFIG_INTERRUPT_SEQUENCE),
            Some(Stage::Config)
        );
    }

    #[rstest]
    #[case(0, false, 1, State::Erroring)]
    #[case(4, false, 5, State::Erroring)]
    #[case(3, true, 0, State::Complete)]
    fn pod_outcome_errors_immediately_on_any_failed_exit(
        #[case] starting_restarts: u32,
        #[case] succeeded: bool,
        #[case] expect_restarts: u32,
        #[case] expect_state: State,
    ) {
        let mut e = entry("1.0.0", Stage::Apply, State::InProgress);
        e.restarts = starting_restarts;
        apply_pod_outcome(&mut e, succeeded);
        assert_eq!(e.restarts, expect_restarts);
        assert_eq!(e.state, expect_state);
    }

    #[test]
    fn interrupts_overlap_requires_shared_service_and_service_kind() {
        let a = Interrupt { kind: InterruptKind::Service, services: vec!["nvidia-fabricmanager".to_owned()] };
        let b = Interrupt { kind: InterruptKind::Service, services: vec!["nvidia-fabricmanager".to_owned(), "kubelet".to_owned()] };
        let c = Interrupt { kind: InterruptKind::Service, services: vec!["containerd".to_owned()] };
        let reboot = Interrupt { kind: InterruptKind::Reboot, services: vec!["nvidia-fabricmanager".to_owned()] };
        assert!(interrupts_overlap(&a, &b));
        assert!(!interrupts_overlap(&a, &c));
        assert!(!interrupts_overlap(&a, &reboot));
    }

    #[test]
    fn config_changed_only_for_watched_keys() {
        let mut pkg = pkg("1.0.0");
        pkg.config_interrupts = Some(
            [(
                "driver.conf".to_owned(),
                skyhook_crd::Interrupt {
                    kind: skyhook_crd::InterruptKind::Service,
                    services: vec!["driverd".to_owned()],
                },
            )]
            .into_iter()
            .collect(),
        );
        assert!(config_changed(&pkg, &["driver.conf".to_owned()]));
        assert!(!config_changed(&pkg, &["other.conf".to_owned()]));
    }
}
