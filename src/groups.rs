use std::collections::BTreeMap;

use serde::Serialize;

use crate::fixture_plan::{FixturePlan, ParameterRole};
use crate::scenes::store::slugify;

/// A live-mix group derived from the fixture plan: fixtures sharing a base
/// name (trailing index stripped) pooled over their intensity addresses.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupLayout {
    pub key: String,
    pub name: String,
    pub fixture_count: usize,
    pub channel_count: usize,
    /// `(universe, 1-based channel)` pairs, sorted.
    pub addresses: Vec<(u16, u16)>,
}

/// "Spot 1" / "Spot 2" → "Spot"; names without a trailing index stay as
/// they are.
fn base_name(fixture_name: &str) -> String {
    let trimmed = fixture_name.trim();
    let without_index = trimmed
        .trim_end_matches(|ch: char| ch.is_ascii_digit())
        .trim_end();
    if without_index.is_empty() {
        trimmed.to_string()
    } else {
        without_index.to_string()
    }
}

pub fn derive_groups(plan: &FixturePlan) -> Vec<GroupLayout> {
    let mut groups: BTreeMap<String, GroupLayout> = BTreeMap::new();

    for fixture in &plan.fixtures {
        let name = base_name(&fixture.fixture);
        let key = slugify(&name);
        let group = groups.entry(key.clone()).or_insert_with(|| GroupLayout {
            key,
            name,
            fixture_count: 0,
            channel_count: 0,
            addresses: Vec::new(),
        });
        group.fixture_count += 1;
        for parameter in &fixture.parameters {
            if parameter.role == ParameterRole::Intensity {
                group.addresses.push((parameter.universe, parameter.channel));
            }
        }
    }

    let mut layouts: Vec<GroupLayout> = groups.into_values().collect();
    for group in &mut layouts {
        group.addresses.sort_unstable();
        group.addresses.dedup();
        group.channel_count = group.addresses.len();
    }
    layouts
}

impl crate::mixer::FixtureMetadata for crate::fixture_plan::FixturePlanState {
    fn intensity_addresses(&self) -> Option<std::collections::HashSet<(u16, u16)>> {
        crate::fixture_plan::FixturePlanState::intensity_addresses(self)
    }

    fn groups(&self) -> Vec<GroupLayout> {
        self.with_plan(|plan| plan.map(derive_groups).unwrap_or_default())
    }
}
