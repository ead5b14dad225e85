//! Resource dependency graph.
//!
//! Edges come from explicit `depends_on` entries and from every
//! `${resource.<name>...}` reference found in a declaration's properties.

use keel_core::{Error, ResourceDeclaration, Result};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone)]
pub struct ResourceGraph {
    /// Declarations in topological order (dependencies first).
    nodes: Vec<ResourceDeclaration>,
    index: HashMap<String, usize>,
    dependencies: HashMap<String, BTreeSet<String>>,
    dependents: HashMap<String, BTreeSet<String>>,
}

impl ResourceGraph {
    /// Build and validate the graph.
    pub fn build(declarations: Vec<ResourceDeclaration>) -> Result<Self> {
        let mut dependencies: HashMap<String, BTreeSet<String>> = HashMap::new();
        for decl in &declarations {
            if dependencies.contains_key(&decl.name) {
                return Err(Error::Duplicate(format!("resource '{}'", decl.name)));
            }
            let mut deps: BTreeSet<String> = decl.options.depends_on.iter().cloned().collect();
            deps.extend(decl.referenced_resources().into_iter().map(str::to_string));
            dependencies.insert(decl.name.clone(), deps);
        }

        for decl in &declarations {
            for dep in &dependencies[&decl.name] {
                if dep == &decl.name {
                    return Err(Error::CycleDetected(format!("{} -> {}", decl.name, dep)));
                }
                if !dependencies.contains_key(dep) {
                    return Err(Error::InvalidReference(format!(
                        "resource '{}' depends on unknown resource '{}'",
                        decl.name, dep
                    )));
                }
            }
        }

        detect_cycle(&declarations, &dependencies).map_err(Error::CycleDetected)?;

        let order = topological_sort(&declarations, &dependencies);
        let mut by_name: HashMap<String, ResourceDeclaration> = declarations
            .into_iter()
            .map(|d| (d.name.clone(), d))
            .collect();
        let nodes: Vec<ResourceDeclaration> = order
            .iter()
            .filter_map(|name| by_name.remove(name))
            .collect();
        let index = nodes
            .iter()
            .enumerate()
            .map(|(i, d)| (d.name.clone(), i))
            .collect();

        let mut dependents: HashMap<String, BTreeSet<String>> = nodes
            .iter()
            .map(|d| (d.name.clone(), BTreeSet::new()))
            .collect();
        for (name, deps) in &dependencies {
            for dep in deps {
                if let Some(set) = dependents.get_mut(dep) {
                    set.insert(name.clone());
                }
            }
        }

        Ok(Self {
            nodes,
            index,
            dependencies,
            dependents,
        })
    }

    /// Declarations, dependencies before dependents.
    pub fn declarations(&self) -> &[ResourceDeclaration] {
        &self.nodes
    }

    pub fn get(&self, name: &str) -> Option<&ResourceDeclaration> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Direct dependencies of a resource.
    pub fn dependencies(&self, name: &str) -> impl Iterator<Item = &str> {
        self.dependencies
            .get(name)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// Direct dependents of a resource.
    pub fn dependents(&self, name: &str) -> impl Iterator<Item = &str> {
        self.dependents
            .get(name)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    /// Every resource that depends on `name`, directly or transitively.
    pub fn transitive_dependents(&self, name: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = self.dependents(name).collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next.to_string()) {
                stack.extend(self.dependents(next));
            }
        }
        seen
    }

    /// Names in topological order.
    pub fn order(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|d| d.name.as_str())
    }
}

/// Detect cycles in the dependency graph using DFS.
fn detect_cycle(
    declarations: &[ResourceDeclaration],
    dependencies: &HashMap<String, BTreeSet<String>>,
) -> std::result::Result<(), String> {
    let mut visited = HashMap::new();
    let mut rec_stack = HashMap::new();

    for decl in declarations {
        if !visited.contains_key(decl.name.as_str()) {
            if let Some(cycle) =
                dfs_detect_cycle(&decl.name, dependencies, &mut visited, &mut rec_stack)
            {
                return Err(cycle);
            }
        }
    }
    Ok(())
}

fn dfs_detect_cycle<'a>(
    node: &'a str,
    dependencies: &'a HashMap<String, BTreeSet<String>>,
    visited: &mut HashMap<&'a str, bool>,
    rec_stack: &mut HashMap<&'a str, bool>,
) -> Option<String> {
    visited.insert(node, true);
    rec_stack.insert(node, true);

    if let Some(deps) = dependencies.get(node) {
        for dep in deps {
            let dep_str: &'a str = dep.as_str();
            if !visited.contains_key(dep_str) {
                if let Some(cycle) = dfs_detect_cycle(dep_str, dependencies, visited, rec_stack) {
                    return Some(cycle);
                }
            } else if rec_stack.get(dep_str).copied().unwrap_or(false) {
                return Some(format!("{} -> {}", node, dep));
            }
        }
    }

    rec_stack.insert(node, false);
    None
}

/// Topological sort; ties keep declaration order.
fn topological_sort(
    declarations: &[ResourceDeclaration],
    dependencies: &HashMap<String, BTreeSet<String>>,
) -> Vec<String> {
    let mut result = Vec::new();
    let mut visited = HashMap::new();

    for decl in declarations {
        topo_visit(&decl.name, dependencies, &mut visited, &mut result);
    }

    result
}

fn topo_visit(
    name: &str,
    dependencies: &HashMap<String, BTreeSet<String>>,
    visited: &mut HashMap<String, bool>,
    result: &mut Vec<String>,
) {
    if visited.get(name).copied().unwrap_or(false) {
        return;
    }

    visited.insert(name.to_string(), true);

    if let Some(deps) = dependencies.get(name) {
        for dep in deps {
            topo_visit(dep, dependencies, visited, result);
        }
    }

    result.push(name.to_string());
}

/// Order names so that every name comes after the names it depends on,
/// using an explicit dependency map (for recorded state, where no
/// declarations exist). Unknown dependencies are ignored.
pub fn order_by_dependencies(deps: &HashMap<String, Vec<String>>) -> Vec<String> {
    let mut names: Vec<&String> = deps.keys().collect();
    names.sort();
    let known: HashMap<String, BTreeSet<String>> = deps
        .iter()
        .map(|(k, v)| {
            (
                k.clone(),
                v.iter().filter(|d| deps.contains_key(*d)).cloned().collect(),
            )
        })
        .collect();
    let mut result = Vec::new();
    let mut visited = HashMap::new();
    for name in names {
        topo_visit(name, &known, &mut visited, &mut result);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::value::{PropertyValue, Reference};
    use keel_core::ResourceType;

    fn decl(name: &str, deps: &[&str]) -> ResourceDeclaration {
        let mut d = ResourceDeclaration::new(name, ResourceType::manifest("v1", "ConfigMap"));
        d.options.depends_on = deps.iter().map(|s| s.to_string()).collect();
        d
    }

    #[test]
    fn test_topological_order() {
        let graph = ResourceGraph::build(vec![
            decl("deploy", &["build"]),
            decl("test", &[]),
            decl("build", &["test"]),
        ])
        .unwrap();

        let order: Vec<&str> = graph.order().collect();
        let pos = |n: &str| order.iter().position(|s| *s == n).unwrap();
        assert!(pos("test") < pos("build"));
        assert!(pos("build") < pos("deploy"));
    }

    #[test]
    fn test_reference_creates_edge() {
        let consumer = decl("app", &[]).with_property(
            "host",
            PropertyValue::Ref(Reference::Resource {
                resource: "db".into(),
                path: "status.host".into(),
            }),
        );
        let graph = ResourceGraph::build(vec![consumer, decl("db", &[])]).unwrap();
        assert_eq!(graph.dependencies("app").collect::<Vec<_>>(), vec!["db"]);
        assert_eq!(graph.order().collect::<Vec<_>>(), vec!["db", "app"]);
    }

    #[test]
    fn test_unknown_dependency() {
        let err = ResourceGraph::build(vec![decl("a", &["missing"])]).unwrap_err();
        assert!(matches!(err, Error::InvalidReference(_)));
    }

    #[test]
    fn test_detect_cycle() {
        let err = ResourceGraph::build(vec![
            decl("a", &["c"]),
            decl("b", &["a"]),
            decl("c", &["b"]),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::CycleDetected(_)));

        let err = ResourceGraph::build(vec![decl("a", &["a"])]).unwrap_err();
        assert!(matches!(err, Error::CycleDetected(_)));
    }

    #[test]
    fn test_duplicate() {
        let err = ResourceGraph::build(vec![decl("a", &[]), decl("a", &[])]).unwrap_err();
        assert!(matches!(err, Error::Duplicate(_)));
    }

    #[test]
    fn test_transitive_dependents() {
        let graph = ResourceGraph::build(vec![
            decl("a", &[]),
            decl("b", &["a"]),
            decl("c", &["b"]),
            decl("d", &[]),
        ])
        .unwrap();
        let deps = graph.transitive_dependents("a");
        assert_eq!(deps.into_iter().collect::<Vec<_>>(), vec!["b", "c"]);
        assert!(graph.transitive_dependents("d").is_empty());
    }

    #[test]
    fn test_order_by_dependencies() {
        let deps = HashMap::from([
            ("app".to_string(), vec!["db".to_string(), "gone".to_string()]),
            ("db".to_string(), vec!["namespace".to_string()]),
            ("namespace".to_string(), vec![]),
        ]);
        assert_eq!(order_by_dependencies(&deps), vec!["namespace", "db", "app"]);
    }
}
