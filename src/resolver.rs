//! Dependency ordering for recipes
//!
//! Orders a recipe and its transitive build dependencies so every dependency
//! precedes its dependents. The walk is depth-first in declaration order, so
//! the output is deterministic for a given set of recipes.
//!
//! ```text
//! app -> [lib, util]      resolve("app") = [base, lib, util, app]
//! lib -> [base]           levels         = [[base, util], [lib], [app]]
//! util -> []
//! ```

use crate::error::{KilnError, KilnResult};
use crate::recipe::{Recipe, RecipeSet};
use std::collections::{HashMap, HashSet};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

struct Walk<'a> {
    available: &'a RecipeSet,
    marks: HashMap<String, Mark>,
    path: Vec<String>,
    order: Vec<String>,
}

impl<'a> Walk<'a> {
    fn new(available: &'a RecipeSet) -> Self {
        Self {
            available,
            marks: HashMap::new(),
            path: Vec::new(),
            order: Vec::new(),
        }
    }

    fn visit(&mut self, recipe: &Recipe) -> KilnResult<()> {
        match self.marks.get(&recipe.name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = self
                    .path
                    .iter()
                    .position(|n| n == &recipe.name)
                    .unwrap_or(0);
                let mut cycle = self.path[start..].to_vec();
                cycle.push(recipe.name.clone());
                return Err(KilnError::DependencyCycle { cycle });
            }
            None => {}
        }

        self.marks.insert(recipe.name.clone(), Mark::Visiting);
        self.path.push(recipe.name.clone());

        let available = self.available;
        for dep in &recipe.dependencies {
            let next = available.get(dep).ok_or_else(|| {
                KilnError::UnresolvedDependency {
                    dependency: dep.clone(),
                    required_by: recipe.name.clone(),
                }
            })?;
            self.visit(next)?;
        }

        self.path.pop();
        self.marks.insert(recipe.name.clone(), Mark::Done);
        self.order.push(recipe.name.clone());
        Ok(())
    }
}

/// Order `recipe` and its transitive dependencies; the last element is `recipe`
pub fn resolve(recipe: &Recipe, available: &RecipeSet) -> KilnResult<Vec<String>> {
    let mut walk = Walk::new(available);
    walk.visit(recipe)?;
    Ok(walk.order)
}

/// Order several roots into one sequence without duplicates
pub fn resolve_many(roots: &[String], available: &RecipeSet) -> KilnResult<Vec<String>> {
    let mut walk = Walk::new(available);
    for root in roots {
        let recipe = available
            .get(root)
            .ok_or_else(|| KilnError::RecipeNotFound(root.clone()))?;
        walk.visit(recipe)?;
    }
    Ok(walk.order)
}

/// Group a resolved order into waves that can run concurrently.
///
/// Every member of a wave depends only on members of earlier waves. Within a
/// wave, names keep their position from `order`.
pub fn levels(order: &[String], available: &RecipeSet) -> KilnResult<Vec<Vec<String>>> {
    let mut depth: HashMap<&str, usize> = HashMap::new();
    let mut waves: Vec<Vec<String>> = Vec::new();

    for name in order {
        let recipe = available
            .get(name)
            .ok_or_else(|| KilnError::RecipeNotFound(name.clone()))?;

        let mut level = 0;
        for dep in &recipe.dependencies {
            let dep_level = depth.get(dep.as_str()).ok_or_else(|| {
                KilnError::Internal(format!(
                    "'{}' is ordered before its dependency '{}'",
                    name, dep
                ))
            })?;
            level = level.max(dep_level + 1);
        }

        depth.insert(name.as_str(), level);
        if waves.len() <= level {
            waves.resize_with(level + 1, Vec::new);
        }
        waves[level].push(name.clone());
    }

    Ok(waves)
}

/// Names in `installed` that directly depend on `name`
pub fn dependents<'a, I>(name: &str, installed: I) -> Vec<String>
where
    I: IntoIterator<Item = (&'a String, &'a [String])>,
{
    let mut seen = HashSet::new();
    let mut out: Vec<String> = installed
        .into_iter()
        .filter(|(_, deps)| deps.iter().any(|d| d == name))
        .map(|(n, _)| n.clone())
        .filter(|n| seen.insert(n.clone()))
        .collect();
    out.sort();
    out
}
