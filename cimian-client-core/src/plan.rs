//! The Dependency & Update Resolver (spec §4.E): `Plan(desired, catalog, facts) -> Plan`.
//!
//! Walks `requires` transitively for each desired install/update, gathers
//! additional updates from catalog items whose `update_for` names an
//! already-planned item, and orders dependencies before dependents. For
//! uninstalls, walks the reverse edge (`dependent_removal`) so dependents
//! are removed before the items they depend on. Cycles in `requires` are a
//! fatal error, grounded on the teacher's `repo::resolve_package_set`
//! transitive-dependency walk (`repo.rs`), with an explicit grey/black
//! coloring pass added since a `requires` cycle must be reported rather
//! than silently deduplicated away.

use std::collections::HashMap;

use cimian_types::SystemFacts;
use thiserror::Error;
use log::warn;

use crate::catalog::{ByNameResult, CatalogIndex};
use crate::evaluate;
use crate::resolve::{Action, ResolvedDesiredState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlanAction {
    Install,
    Update,
    Uninstall,
}

#[derive(Debug, Clone)]
pub struct PlanCandidate {
    pub name: String,
    pub action: PlanAction,
    pub source_chain: Vec<String>,
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("dependency cycle detected: {0}")]
    Cycle(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Grey,
    Black,
}

struct InstallWalk<'a> {
    catalog: &'a CatalogIndex,
    facts: &'a SystemFacts,
    color: HashMap<String, Color>,
    output: Vec<PlanCandidate>,
    stack: Vec<String>,
}

impl<'a> InstallWalk<'a> {
    /// `action` is the `PlanAction` recorded for `name` itself once the walk
    /// reaches it; transitive `requires` dependencies are always walked (and
    /// recorded) as `PlanAction::Install` per spec §4.E step 2, regardless of
    /// the action that pulled them in.
    fn visit(&mut self, name: &str, chain: Vec<String>, action: PlanAction) -> Result<(), PlanError> {
        match self.color.get(name) {
            Some(Color::Black) => return Ok(()),
            Some(Color::Grey) => {
                let mut cycle = self.stack.clone();
                cycle.push(name.to_string());
                return Err(PlanError::Cycle(cycle.join(" -> ")));
            }
            None => {}
        }

        self.color.insert(name.to_string(), Color::Grey);
        self.stack.push(name.to_string());

        match self.catalog.by_name(name, &self.facts.arch) {
            ByNameResult::Found(item) => {
                for req in &item.requires {
                    let mut req_chain = chain.clone();
                    req_chain.push(format!("requires:{}", name));
                    self.visit(req, req_chain, PlanAction::Install)?;
                }
            }
            ByNameResult::ArchitectureMismatch { .. } => {
                warn!(
                    "`{}` has no catalog entry supporting arch `{}`; skipping",
                    name, self.facts.arch
                );
            }
            ByNameResult::NotFound => {
                warn!("`{}` not found in catalog; skipping requires edge", name);
            }
        }

        self.color.insert(name.to_string(), Color::Black);
        self.stack.pop();

        self.output.push(PlanCandidate {
            name: name.to_string(),
            action,
            source_chain: chain,
        });

        Ok(())
    }
}

fn collect_update_for(
    catalog: &CatalogIndex,
    facts: &SystemFacts,
    planned_names: &[String],
    output: &mut Vec<PlanCandidate>,
) {
    let planned: std::collections::HashSet<&str> =
        planned_names.iter().map(|s| s.as_str()).collect();

    for item in catalog.all() {
        for target in &item.update_for {
            if !planned.contains(target.as_str()) {
                continue;
            }
            if output.iter().any(|c| c.name == item.name) {
                continue;
            }
            let installed = evaluate::evaluate(item, facts).installed_version;
            let is_higher = match installed {
                None => true,
                Some(v) => v < item.version,
            };
            if is_higher {
                output.push(PlanCandidate {
                    name: item.name.clone(),
                    action: PlanAction::Update,
                    source_chain: vec![format!("update_for:{}", target)],
                });
            }
        }
    }
}

fn distinct_names_with_requires<'a>(catalog: &'a CatalogIndex, target: &str) -> Vec<String> {
    let mut names: Vec<String> = catalog
        .all()
        .filter(|item| item.requires.iter().any(|r| r == target))
        .map(|item| item.name.clone())
        .collect();
    names.sort();
    names.dedup();
    names
}

fn collect_uninstall(
    catalog: &CatalogIndex,
    facts: &SystemFacts,
    name: &str,
    visited: &mut std::collections::HashSet<String>,
    output: &mut Vec<PlanCandidate>,
) {
    if !visited.insert(name.to_string()) {
        return;
    }

    for dependent in distinct_names_with_requires(catalog, name) {
        let installed = match catalog.by_name(&dependent, &facts.arch) {
            ByNameResult::Found(item) => evaluate::evaluate(item, facts).installed_version.is_some(),
            _ => false,
        };
        if installed {
            collect_uninstall(catalog, facts, &dependent, visited, output);
        }
    }

    output.push(PlanCandidate {
        name: name.to_string(),
        action: PlanAction::Uninstall,
        source_chain: vec!["dependent_removal".to_string()],
    });
}

pub fn build_plan(
    desired: &ResolvedDesiredState,
    catalog: &CatalogIndex,
    facts: &SystemFacts,
) -> Result<Vec<PlanCandidate>, PlanError> {
    let mut walk = InstallWalk {
        catalog,
        facts,
        color: HashMap::new(),
        output: Vec::new(),
        stack: Vec::new(),
    };

    for (action, plan_action) in [
        (Action::Install, PlanAction::Install),
        (Action::Update, PlanAction::Update),
        (Action::Profile, PlanAction::Install),
        (Action::App, PlanAction::Install),
    ] {
        for item in desired.by_action(action) {
            walk.visit(&item.name, item.source.chain.clone(), plan_action)?;
        }
    }

    let mut output = walk.output;
    let planned_names: Vec<String> = output.iter().map(|c| c.name.clone()).collect();
    collect_update_for(catalog, facts, &planned_names, &mut output);

    let mut uninstall_visited = std::collections::HashSet::new();
    for item in desired.by_action(Action::Uninstall) {
        collect_uninstall(catalog, facts, &item.name, &mut uninstall_visited, &mut output);
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::Action;
    use chrono::Utc;
    use cimian_types::{BatteryState, JoinedType, MachineType, Version};
    use std::str::FromStr;

    fn facts() -> SystemFacts {
        SystemFacts {
            hostname: "host".into(),
            arch: "x64".into(),
            os_vers_major: 10,
            os_vers_minor: 0,
            build_number: 1,
            domain: String::new(),
            username: String::new(),
            machine_type: MachineType::Desktop,
            machine_model: String::new(),
            serial_number: String::new(),
            joined_type: JoinedType::Workgroup,
            catalogs: vec![],
            enrolled_usage: String::new(),
            enrolled_area: String::new(),
            device_id: String::new(),
            battery_state: BatteryState::Unknown,
            date: Utc::now(),
        }
    }

    fn item(name: &str, version: &str, requires: Vec<&str>) -> cimian_types::CatalogItem {
        cimian_types::CatalogItem::builder()
            .name(name.to_string())
            .display_name(name.to_string())
            .version(Version::from_str(version).unwrap())
            .requires(requires.into_iter().map(|s| s.to_string()).collect::<Vec<_>>())
            .build()
    }

    #[test]
    fn test_cycle_detected() {
        let mut index = CatalogIndex::default();
        index.insert(item("A", "1.0", vec!["B"]));
        index.insert(item("B", "1.0", vec!["A"]));

        let desired = crate::resolve::tests_support::single(Action::Install, "A");
        let result = build_plan(&desired, &index, &facts());
        assert!(matches!(result, Err(PlanError::Cycle(_))));
    }

    #[test]
    fn test_requires_ordered_before_dependent() {
        let mut index = CatalogIndex::default();
        index.insert(item("App", "1.0", vec!["Runtime"]));
        index.insert(item("Runtime", "1.0", vec![]));

        let desired = crate::resolve::tests_support::single(Action::Install, "App");
        let plan = build_plan(&desired, &index, &facts()).unwrap();

        let runtime_pos = plan.iter().position(|c| c.name == "Runtime").unwrap();
        let app_pos = plan.iter().position(|c| c.name == "App").unwrap();
        assert!(runtime_pos < app_pos);
    }

    #[test]
    fn test_manifest_update_candidate_keeps_update_action() {
        let mut index = CatalogIndex::default();
        index.insert(item("Widget", "2.0", vec![]));

        let desired = crate::resolve::tests_support::single(Action::Update, "Widget");
        let plan = build_plan(&desired, &index, &facts()).unwrap();

        let candidate = plan.iter().find(|c| c.name == "Widget").unwrap();
        assert_eq!(candidate.action, PlanAction::Update);
    }
}
