//! Apply order of the units of one run
//!
//! Depth-first topological sort with three-color marking. A unit referenced
//! through `${resource:x.prop}` is applied before the unit referencing it.
//! Independent units keep their declaration order.

use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Dependencies of every unit, keyed by unit name
pub type Dependencies = BTreeMap<String, BTreeSet<String>>;

/// Ordering failure: the units forming the cycle, first unit repeated last
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle(pub Vec<String>);

struct TopoSortContext<'a> {
    deps: &'a Dependencies,
    /// Fully processed (BLACK)
    visited: HashSet<String>,
    /// Current DFS path (GRAY), in visit order
    path: Vec<String>,
    result: Vec<String>,
}

/// Sort `units` so that every unit follows its dependencies.
///
/// Dependencies naming units outside `units` are ignored; they are satisfied
/// by earlier runs.
pub fn dependency_order(units: &[String], deps: &Dependencies) -> Result<Vec<String>, Cycle> {
    let known: HashSet<&str> = units.iter().map(String::as_str).collect();
    let filtered: Dependencies = deps
        .iter()
        .map(|(unit, targets)| {
            let targets = targets
                .iter()
                .filter(|t| known.contains(t.as_str()))
                .cloned()
                .collect();
            (unit.clone(), targets)
        })
        .collect();

    let mut ctx = TopoSortContext {
        deps: &filtered,
        visited: HashSet::new(),
        path: Vec::new(),
        result: Vec::with_capacity(units.len()),
    };

    for unit in units {
        if !ctx.visited.contains(unit) {
            topo_dfs(&mut ctx, unit, units)?;
        }
    }
    Ok(ctx.result)
}

fn topo_dfs(ctx: &mut TopoSortContext, name: &str, units: &[String]) -> Result<(), Cycle> {
    if let Some(start) = ctx.path.iter().position(|n| n == name) {
        let mut cycle = ctx.path[start..].to_vec();
        cycle.push(name.to_string());
        return Err(Cycle(cycle));
    }
    if ctx.visited.contains(name) {
        return Ok(());
    }

    ctx.path.push(name.to_string());
    if let Some(targets) = ctx.deps.get(name) {
        // Visit dependencies in declaration order
        let ordered: Vec<&String> = units.iter().filter(|u| targets.contains(*u)).collect();
        for dep in ordered {
            topo_dfs(ctx, dep, units)?;
        }
    }
    ctx.path.pop();

    ctx.visited.insert(name.to_string());
    ctx.result.push(name.to_string());
    Ok(())
}
