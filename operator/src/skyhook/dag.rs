use std::collections::{BTreeMap, BTreeSet};

use skyhook_crd::Package;

use crate::util::{Error, ErrorKind};

/// Topological walker over a Skyhook's packages, related by
/// `dependsOn: name -> version` (§4.3). Built once per reconcile from
/// the spec's package map.
pub struct Dag<'a> {
    packages: &'a BTreeMap<String, Package>,
}

impl<'a> Dag<'a> {
    pub fn new(packages: &'a BTreeMap<String, Package>) -> Self {
        Dag { packages }
    }

    /// The graph is invalid if any referenced dependency name is absent
    /// from the package map. Returns the first missing reference found,
    /// for precise error reporting.
    pub fn valid(&self) -> Result<(), Error> {
        for (name, pkg) in self.packages {
            if let Some(deps) = &pkg.depends_on {
                for dep_name in deps.keys() {
                    if !self.packages.contains_key(dep_name) {
                        return Err(Error::MissingDependency(name.clone(), dep_name.clone()));
                    }
                }
            }
        }
        if let Some(cycle_member) = self.find_cycle() {
            return Err(Error::CyclicDependency(cycle_member));
        }
        Ok(())
    }

    fn find_cycle(&self) -> Option<String> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }
        let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();

        fn visit<'a>(
            name: &'a str,
            packages: &'a BTreeMap<String, Package>,
            marks: &mut BTreeMap<&'a str, Mark>,
        ) -> Option<String> {
            match marks.get(name) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => return Some(name.to_owned()),
                None => {}
            }
            marks.insert(name, Mark::Visiting);
            if let Some(pkg) = packages.get(name)
                && let Some(deps) = &pkg.depends_on
            {
                for dep_name in deps.keys() {
                    if let Some(found) = visit(dep_name, packages, marks) {
                        return Some(found);
                    }
                }
            }
            marks.insert(name, Mark::Done);
            None
        }

        for name in self.packages.keys() {
            if let Some(found) = visit(name, self.packages, &mut marks) {
                return Some(found);
            }
        }
        None
    }

    /// Every package whose direct predecessors are all in `completed`
    /// and which is not itself in `completed`, sorted alphabetically for
    /// determinism.
    pub fn next(&self, completed: &BTreeSet<String>) -> Vec<String> {
        let mut runnable: Vec<String> = self
            .packages
            .iter()
            .filter(|(name, _)| !completed.contains(*name))
            .filter(|(_, pkg)| {
                pkg.depends_on
                    .as_ref()
                    .map(|deps| deps.keys().all(|dep| completed.contains(dep)))
                    .unwrap_or(true)
            })
            .map(|(name, _)| name.clone())
            .collect();
        runnable.sort();
        runnable
    }

    /// `RunNext` for one node: completed packages come from the node's
    /// `GetComplete()` view. If the leaf set is empty but not every
    /// package is complete (e.g. the spec grew new leaves after an
    /// edit), re-seed from the DAG's own leaves, filtering out what is
    /// already done.
    pub fn run_next(&self, node_complete: &[String]) -> Vec<String> {
        let completed: BTreeSet<String> = node_complete.iter().cloned().collect();
        let mut result = self.next(&completed);
        if result.is_empty() && completed.len() < self.packages.len() {
            result = self
                .packages
                .keys()
                .filter(|name| !completed.contains(*name))
                .filter(|name| {
                    self.packages[*name]
                        .depends_on
                        .as_ref()
                        .map(|deps| deps.keys().all(|dep| completed.contains(dep)))
                        .unwrap_or(true)
                })
                .cloned()
                .collect();
        }
        result.sort();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use semver::Version;
    use skyhook_crd::Package;

    fn pkg(name: &str, depends_on: &[&str]) -> Package {
        Package {
            name: name.to_owned(),
            version: Version::parse("1.0.0").unwrap(),
            image: format!("example/{name}:1.0.0"),
            env: None,
            config_map: None,
            config_interrupts: None,
            interrupt: None,
            depends_on: if depends_on.is_empty() {
                None
            } else {
                Some(
                    depends_on
                        .iter()
                        .map(|d| (d.to_string(), Version::parse("1.0.0").unwrap()))
                        .collect(),
                )
            },
            resources: None,
            graceful_shutdown: None,
            agent_image_override: None,
        }
    }

    /// Scenario from spec.md §8: A, B independent; C depends on A,B; D, E
    /// depend on C; F depends on D, E.
    fn scenario_packages() -> BTreeMap<String, Package> {
        [
            pkg("A", &[]),
            pkg("B", &[]),
            pkg("C", &["A", "B"]),
            pkg("D", &["C"]),
            pkg("E", &["C"]),
            pkg("F", &["D", "E"]),
        ]
        .into_iter()
        .map(|p| (p.name.clone(), p))
        .collect()
    }

    #[test]
    fn dependency_order_matches_scenario() {
        let packages = scenario_packages();
        let dag = Dag::new(&packages);
        assert!(dag.valid().is_ok());

        let mut completed: Vec<String> = vec![];
        assert_eq!(dag.run_next(&completed), vec!["A", "B"]);

        completed.push("A".to_owned());
        assert_eq!(dag.run_next(&completed), vec!["B"]);

        completed.push("B".to_owned());
        assert_eq!(dag.run_next(&completed), vec!["C"]);

        completed.push("C".to_owned());
        assert_eq!(dag.run_next(&completed), vec!["D", "E"]);

        completed.push("E".to_owned());
        assert_eq!(dag.run_next(&completed), vec!["D"]);

        completed.push("D".to_owned());
        assert_eq!(dag.run_next(&completed), vec!["F"]);

        completed.push("F".to_owned());
        assert!(dag.run_next(&completed).is_empty());
    }

    #[test]
    fn missing_dependency_is_invalid() {
        let packages = scenario_packages_with_dangling();
        let dag = Dag::new(&packages);
        let err = dag.valid().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingDependency);
    }

    fn scenario_packages_with_dangling() -> BTreeMap<String, Package> {
        let mut packages = scenario_packages();
        let mut dangling = pkg("G", &["not-a-real-package"]);
        dangling.name = "G".to_owned();
        packages.insert("G".to_owned(), dangling);
        packages
    }

    #[test]
    fn cycle_is_invalid() {
        let mut packages = BTreeMap::new();
        packages.insert("A".to_owned(), pkg("A", &["B"]));
        packages.insert("B".to_owned(), pkg("B", &["A"]));
        let dag = Dag::new(&packages);
        assert_eq!(dag.valid().unwrap_err().kind(), ErrorKind::MissingDependency);
    }

    #[test]
    fn reseeds_from_leaves_after_spec_grows_new_leaf() {
        // C is complete but nothing else has ever run (simulates a spec
        // edit that added a new downstream leaf after C finished).
        let packages = scenario_packages();
        let dag = Dag::new(&packages);
        let node_complete = vec!["A".to_owned(), "B".to_owned(), "C".to_owned()];
        assert_eq!(dag.run_next(&node_complete), vec!["D", "E"]);
    }
}
