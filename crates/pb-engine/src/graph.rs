//! Dependency graph derivation.
//!
//! A step depends on upstream steps through two sources: the explicit
//! `dependencies` list in its configuration, and `{{steps.<key>...}}`
//! references inside its input template. Both are honored, so a step author
//! never has to declare a dependency they already reference.

use pb_core::run::Step;
use regex::Regex;
use std::collections::{BTreeSet, HashMap};
use std::sync::LazyLock;

static STEP_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*steps\.([A-Za-z0-9_-]+)").expect("step reference pattern is valid")
});

/// Extract referenced step keys from an input template, in first-appearance
/// order, deduplicated.
pub fn extract_step_refs(template: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut refs = Vec::new();
    for capture in STEP_REF.captures_iter(template) {
        let key = &capture[1];
        if seen.insert(key.to_string()) {
            refs.push(key.to_string());
        }
    }
    refs
}

/// All dependencies of one step: explicit declarations merged with template
/// references.
pub fn step_dependencies(step: &Step) -> BTreeSet<String> {
    let mut deps: BTreeSet<String> = step.config.dependencies.iter().cloned().collect();
    if let Some(template) = &step.config.input {
        deps.extend(extract_step_refs(template));
    }
    deps
}

/// Dependency sets for every step, keyed by step key.
pub fn dependency_graph(steps: &[Step]) -> HashMap<String, BTreeSet<String>> {
    steps
        .iter()
        .map(|step| (step.key.clone(), step_dependencies(step)))
        .collect()
}
