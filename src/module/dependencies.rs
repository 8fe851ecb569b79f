//! Module dependency resolution
//!
//! Builds the provider graph over installed modules and determines start and
//! stop order.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tracing::debug;

use super::manifest::Dependency;
use super::version::Version;
use crate::error::{CdmfError, Result};

/// Resolution input for one installed module
#[derive(Debug, Clone)]
pub struct ModuleNode {
    pub name: String,
    pub provides: Vec<(String, Version)>,
    pub dependencies: Vec<Dependency>,
}

/// Dependency graph over installed modules
#[derive(Debug, Clone, Default)]
pub struct DependencyResolution {
    /// Module -> providers it depends on
    pub dependencies: BTreeMap<String, Vec<String>>,
    /// Module -> mandatory dependencies nobody satisfies
    pub missing: BTreeMap<String, Vec<String>>,
}

/// Dependency resolver
pub struct ModuleDependencies;

impl ModuleDependencies {
    /// Resolve every node's dependencies
    ///
    /// A dependency is satisfied by the best providing module (highest
    /// version, then name), else by an already registered service as judged
    /// by `service_available`. Optional dependencies never count as missing.
    pub fn resolve<F>(nodes: &[ModuleNode], service_available: F) -> DependencyResolution
    where
        F: Fn(&Dependency) -> bool,
    {
        let mut resolution = DependencyResolution::default();

        for node in nodes {
            let mut providers = BTreeSet::new();
            let mut missing = Vec::new();

            for dep in &node.dependencies {
                let best = nodes
                    .iter()
                    .filter(|other| other.name != node.name)
                    .filter_map(|other| {
                        other
                            .provides
                            .iter()
                            .filter(|(iface, v)| *iface == dep.interface && dep.range.includes(v))
                            .map(|(_, v)| *v)
                            .max()
                            .map(|v| (v, other.name.as_str()))
                    })
                    // Highest version wins; equal versions go to the smaller name
                    .max_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.cmp(a.1)));

                match best {
                    Some((_, provider)) => {
                        providers.insert(provider.to_string());
                    }
                    None if service_available(dep) => {}
                    None if dep.optional => {}
                    None => missing.push(dep.to_string()),
                }
            }

            if !missing.is_empty() {
                resolution.missing.insert(node.name.clone(), missing);
            }
            resolution
                .dependencies
                .insert(node.name.clone(), providers.into_iter().collect());
        }

        debug!(
            "Dependency resolution over {} modules, {} with missing dependencies",
            nodes.len(),
            resolution.missing.len()
        );
        resolution
    }
}

impl DependencyResolution {
    /// Direct providers of `name`
    pub fn dependencies_of(&self, name: &str) -> &[String] {
        self.dependencies
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Modules that depend directly on `name`
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        self.dependencies
            .iter()
            .filter(|(_, deps)| deps.iter().any(|d| d == name))
            .map(|(module, _)| module.clone())
            .collect()
    }

    /// `name` plus everything it transitively depends on
    pub fn closure(&self, name: &str) -> BTreeSet<String> {
        self.walk(name, |n| self.dependencies_of(n).to_vec())
    }

    /// `name` plus everything that transitively depends on it
    pub fn dependents_closure(&self, name: &str) -> BTreeSet<String> {
        self.walk(name, |n| self.dependents_of(n))
    }

    fn walk<F>(&self, start: &str, next: F) -> BTreeSet<String>
    where
        F: Fn(&str) -> Vec<String>,
    {
        let mut seen = BTreeSet::new();
        let mut stack = vec![start.to_string()];
        while let Some(current) = stack.pop() {
            if seen.insert(current.clone()) {
                stack.extend(next(&current));
            }
        }
        seen
    }

    /// Start order for `targets` and their providers, providers first
    pub fn order_for(&self, targets: &[&str]) -> Result<Vec<String>> {
        let mut members = BTreeSet::new();
        for target in targets {
            members.extend(self.closure(target));
        }

        for member in &members {
            if let Some(missing) = self.missing.get(member) {
                return Err(CdmfError::Unresolvable(format!(
                    "{} requires {}",
                    member,
                    missing.join(", ")
                )));
            }
        }

        let (order, cyclic) = self.topological_sort(&members);
        if !cyclic.is_empty() {
            return Err(CdmfError::ResolveFailed(format!(
                "circular dependency between {}",
                cyclic.into_iter().collect::<Vec<_>>().join(", ")
            )));
        }
        Ok(order)
    }

    /// Stop order for `name` and its dependents, dependents first
    ///
    /// Members of a cycle are appended in name order.
    pub fn stop_order(&self, name: &str) -> Vec<String> {
        let members = self.dependents_closure(name);
        let (mut order, cyclic) = self.topological_sort(&members);
        order.extend(cyclic);
        order.reverse();
        order
    }

    /// Every module, dependents before their providers
    pub fn shutdown_order(&self) -> Vec<String> {
        let members: BTreeSet<String> = self.dependencies.keys().cloned().collect();
        let (mut order, cyclic) = self.topological_sort(&members);
        order.extend(cyclic);
        order.reverse();
        order
    }

    /// Kahn's algorithm restricted to `members`
    ///
    /// Returns the sorted prefix and the members left on a cycle.
    fn topological_sort(&self, members: &BTreeSet<String>) -> (Vec<String>, BTreeSet<String>) {
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut graph: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

        for module in members {
            in_degree.entry(module.as_str()).or_insert(0);
            for dep in self.dependencies_of(module) {
                if !members.contains(dep) {
                    continue;
                }
                graph.entry(dep.as_str()).or_default().push(module.as_str());
                *in_degree.entry(module.as_str()).or_insert(0) += 1;
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(&module, _)| module)
            .collect();

        let mut result = Vec::new();
        while let Some(module) = queue.pop_front() {
            result.push(module.to_string());
            if let Some(dependents) = graph.get(module) {
                for dependent in dependents {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(*dependent);
                        }
                    }
                }
            }
        }

        let cyclic = in_degree
            .into_iter()
            .filter(|(_, degree)| *degree > 0)
            .map(|(module, _)| module.to_string())
            .collect();
        (result, cyclic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::version::VersionRange;
    use crate::service::Filter;

    fn node(name: &str, provides: &[(&str, &str)], deps: &[(&str, &str, bool)]) -> ModuleNode {
        ModuleNode {
            name: name.to_string(),
            provides: provides
                .iter()
                .map(|(i, v)| (i.to_string(), v.parse().unwrap()))
                .collect(),
            dependencies: deps
                .iter()
                .map(|(i, r, optional)| Dependency {
                    interface: i.to_string(),
                    range: r.parse::<VersionRange>().unwrap(),
                    filter: Filter::MatchAll,
                    optional: *optional,
                })
                .collect(),
        }
    }

    #[test]
    fn test_chain_order() {
        let nodes = vec![
            node("app", &[], &[("ILog", "*", false)]),
            node("log", &[("ILog", "1.0")], &[("IClock", "[1.0,2.0)", false)]),
            node("clock", &[("IClock", "1.5")], &[]),
        ];
        let res = ModuleDependencies::resolve(&nodes, |_| false);
        assert_eq!(res.order_for(&["app"]).unwrap(), vec!["clock", "log", "app"]);
        assert_eq!(res.order_for(&["log"]).unwrap(), vec!["clock", "log"]);
        assert_eq!(res.stop_order("clock"), vec!["app", "log", "clock"]);
        assert_eq!(res.dependents_of("log"), vec!["app"]);
    }

    #[test]
    fn test_cycle_reported() {
        let nodes = vec![
            node("a", &[("IA", "1.0")], &[("IB", "*", false)]),
            node("b", &[("IB", "1.0")], &[("IA", "*", false)]),
            node("c", &[("IC", "1.0")], &[]),
        ];
        let res = ModuleDependencies::resolve(&nodes, |_| false);
        assert!(matches!(res.order_for(&["a"]), Err(CdmfError::ResolveFailed(_))));
        assert_eq!(res.order_for(&["c"]).unwrap(), vec!["c"]);
    }

    #[test]
    fn test_missing_and_optional() {
        let nodes = vec![
            node("a", &[], &[("IMissing", "*", false)]),
            node("b", &[], &[("IMissing", "*", true)]),
            node("c", &[], &[("IService", "*", false)]),
        ];
        let res = ModuleDependencies::resolve(&nodes, |d| d.interface == "IService");
        assert!(matches!(res.order_for(&["a"]), Err(CdmfError::Unresolvable(_))));
        assert_eq!(res.order_for(&["b"]).unwrap(), vec!["b"]);
        assert_eq!(res.order_for(&["c"]).unwrap(), vec!["c"]);
    }

    #[test]
    fn test_version_range_selects_provider() {
        let nodes = vec![
            node("app", &[], &[("ILog", "[2.0,3.0)", false)]),
            node("log1", &[("ILog", "1.9")], &[]),
            node("log2", &[("ILog", "2.4")], &[]),
            node("log3", &[("ILog", "2.4")], &[]),
            node("log9", &[("ILog", "9.0")], &[]),
        ];
        let res = ModuleDependencies::resolve(&nodes, |_| false);
        assert_eq!(res.dependencies_of("app"), ["log2".to_string()]);
    }
}
