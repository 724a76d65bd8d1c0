use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

use log::warn;
use quick_xml::events::Event as XmlEvent;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};

use crate::config::write_json_file;
use crate::error::ControllerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterRole {
    Intensity,
    Color,
    Position,
    Beam,
    Control,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureParameter {
    /// Zero-based internal universe.
    pub universe: u16,
    /// One-based DMX channel (1..=512).
    pub channel: u16,
    pub name: String,
    pub fixture: String,
    pub role: ParameterRole,
    /// One-based universe as exported by the console.
    pub ma3_universe: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureDefinition {
    pub fixture: String,
    pub parameters: Vec<FixtureParameter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixturePlan {
    #[serde(default = "default_version")]
    pub version: u32,
    pub imported_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_filename: Option<String>,
    pub fixture_count: usize,
    pub parameter_count: usize,
    pub universes: Vec<u16>,
    pub fixtures: Vec<FixtureDefinition>,
    /// Keyed `"universe:channel"` (internal universe, 1-based channel).
    pub address_map: HashMap<String, FixtureParameter>,
}

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct FixturePlanSummary {
    pub active: bool,
    pub source_filename: Option<String>,
    pub imported_at: Option<String>,
    pub fixture_count: usize,
    pub parameter_count: usize,
    /// One-based for display.
    pub universes: Vec<u16>,
    pub example_parameters: Vec<FixtureParameter>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct FixturePlanDetails {
    pub active: bool,
    pub source_filename: Option<String>,
    pub imported_at: Option<String>,
    pub fixture_count: usize,
    pub parameter_count: usize,
    pub universes: Vec<u16>,
    pub fixtures: Vec<FixtureDefinition>,
}

fn address_key(universe: u16, channel: u16) -> String {
    format!("{universe}:{channel}")
}

/// Classify a console parameter name into a mixing role.
pub fn infer_role(parameter_name: &str) -> ParameterRole {
    let value = parameter_name.trim().to_uppercase();
    let contains_any = |tokens: &[&str]| tokens.iter().any(|token| value.contains(token));

    if contains_any(&["DIMMER", "INTENSITY", "MASTERDIM"]) {
        ParameterRole::Intensity
    } else if contains_any(&[
        "COLOR", "COLOUR", "RGB", "CMY", "CTO", "CTB", "WHITE", "UV", "AMBER", "LIME",
    ]) {
        ParameterRole::Color
    } else if contains_any(&["PAN", "TILT", "POSITION", "POS", "ZOOM", "FOCUS", "IRIS"]) {
        ParameterRole::Position
    } else if contains_any(&["SHUTTER", "STROBE", "GOBO", "PRISM", "FROST", "BEAM"]) {
        ParameterRole::Beam
    } else if contains_any(&["MACRO", "PROGRAM", "MODE", "RATE", "SPEED", "CONTROL", "RESET"]) {
        ParameterRole::Control
    } else {
        ParameterRole::Other
    }
}

#[derive(Debug, Deserialize)]
struct ParameterXml {
    #[serde(rename = "@universe", default)]
    universe: String,
    #[serde(rename = "@number", default)]
    number: String,
    #[serde(rename = "@fixture", default)]
    fixture: String,
    #[serde(rename = "@name", default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct ParameterListXml {
    #[serde(rename = "Parameter", default)]
    parameters: Vec<ParameterXml>,
}

fn parse_int_attr(raw: &str, attr: &str) -> Result<i64, ControllerError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ControllerError::InvalidInput(format!(
            "missing attribute '{attr}'"
        )));
    }
    trimmed.parse::<i64>().map_err(|_| {
        ControllerError::InvalidInput(format!("invalid integer for '{attr}': {trimmed:?}"))
    })
}

fn root_tag_name(xml: &str) -> Result<String, ControllerError> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(XmlEvent::Start(start)) | Ok(XmlEvent::Empty(start)) => {
                return Ok(String::from_utf8_lossy(start.name().as_ref()).to_string());
            }
            Ok(XmlEvent::Eof) => {
                return Err(ControllerError::InvalidInput(
                    "XML has no root element".to_string(),
                ));
            }
            Err(err) => {
                return Err(ControllerError::InvalidInput(format!("invalid XML: {err}")));
            }
            _ => {}
        }
        buf.clear();
    }
}

/// Parse a console `ParameterListExport` XML into a fixture plan.
///
/// MA3 universes are 1-based on the wire and 0-based internally; channels
/// stay 1-based. A DMX address claimed by two parameters is an import
/// error rather than a silent overwrite.
pub fn parse_fixture_plan_xml(
    xml_content: &str,
    source_filename: Option<&str>,
) -> Result<FixturePlan, ControllerError> {
    if xml_content.trim().is_empty() {
        return Err(ControllerError::InvalidInput(
            "XML content is empty".to_string(),
        ));
    }

    let root = root_tag_name(xml_content)?;
    if root != "ParameterListExport" {
        return Err(ControllerError::InvalidInput(format!(
            "root tag must be 'ParameterListExport', got {root:?}"
        )));
    }

    let parsed: ParameterListXml = quick_xml::de::from_str(xml_content)
        .map_err(|err| ControllerError::InvalidInput(format!("invalid XML: {err}")))?;
    if parsed.parameters.is_empty() {
        return Err(ControllerError::InvalidInput(
            "no <Parameter> entries found".to_string(),
        ));
    }

    let mut fixture_to_parameters: HashMap<String, Vec<FixtureParameter>> = HashMap::new();
    let mut address_map: HashMap<String, FixtureParameter> = HashMap::new();
    let mut universes: HashSet<u16> = HashSet::new();

    for element in &parsed.parameters {
        let ma3_universe = parse_int_attr(&element.universe, "universe")?;
        let channel = parse_int_attr(&element.number, "number")?;
        if ma3_universe < 1 {
            return Err(ControllerError::InvalidInput(format!(
                "universe must be >= 1, got {ma3_universe}"
            )));
        }
        if !(1..=512).contains(&channel) {
            return Err(ControllerError::InvalidInput(format!(
                "channel must be 1..512, got {channel}"
            )));
        }

        let fixture_name = element.fixture.trim();
        if fixture_name.is_empty() {
            return Err(ControllerError::InvalidInput(
                "fixture name must not be empty".to_string(),
            ));
        }
        let parameter_name = element.name.trim();
        if parameter_name.is_empty() {
            return Err(ControllerError::InvalidInput(
                "parameter name must not be empty".to_string(),
            ));
        }

        let universe = (ma3_universe - 1) as u16;
        let channel = channel as u16;
        let parameter = FixtureParameter {
            universe,
            channel,
            name: parameter_name.to_string(),
            fixture: fixture_name.to_string(),
            role: infer_role(parameter_name),
            ma3_universe: ma3_universe as u16,
        };

        let key = address_key(universe, channel);
        if let Some(existing) = address_map.get(&key) {
            return Err(ControllerError::InvalidInput(format!(
                "duplicate DMX address mapping for universe {ma3_universe}, channel {channel}: \
                 {}/{} and {}/{}",
                existing.fixture, existing.name, parameter.fixture, parameter.name
            )));
        }

        address_map.insert(key, parameter.clone());
        universes.insert(universe);
        fixture_to_parameters
            .entry(fixture_name.to_string())
            .or_default()
            .push(parameter);
    }

    let mut fixtures: Vec<FixtureDefinition> = Vec::with_capacity(fixture_to_parameters.len());
    let mut fixture_names: Vec<String> = fixture_to_parameters.keys().cloned().collect();
    fixture_names.sort();
    for fixture_name in fixture_names {
        let mut parameters = fixture_to_parameters.remove(&fixture_name).unwrap();
        parameters.sort_by(|a, b| {
            (a.universe, a.channel, &a.name).cmp(&(b.universe, b.channel, &b.name))
        });
        fixtures.push(FixtureDefinition {
            fixture: fixture_name,
            parameters,
        });
    }

    let mut universes: Vec<u16> = universes.into_iter().collect();
    universes.sort_unstable();

    Ok(FixturePlan {
        version: 1,
        imported_at: chrono::Utc::now().to_rfc3339(),
        source_filename: source_filename.map(|name| name.trim().to_string()),
        fixture_count: fixtures.len(),
        parameter_count: address_map.len(),
        universes,
        fixtures,
        address_map,
    })
}

fn build_summary(plan: &FixturePlan, active: bool) -> FixturePlanSummary {
    let all: Vec<&FixtureParameter> = plan
        .fixtures
        .iter()
        .flat_map(|fixture| fixture.parameters.iter())
        .collect();
    let preferred: Vec<&FixtureParameter> = all
        .iter()
        .copied()
        .filter(|parameter| {
            matches!(parameter.role, ParameterRole::Intensity | ParameterRole::Color)
        })
        .collect();
    let examples = if preferred.is_empty() { &all } else { &preferred };

    FixturePlanSummary {
        active,
        source_filename: plan.source_filename.clone(),
        imported_at: Some(plan.imported_at.clone()),
        fixture_count: plan.fixture_count,
        parameter_count: plan.parameter_count,
        universes: plan.universes.iter().map(|u| u + 1).collect(),
        example_parameters: examples.iter().take(8).map(|p| (*p).clone()).collect(),
    }
}

/// The active fixture plan, persisted as JSON and reloaded on startup.
/// `None` means no plan: the master dimmer falls back to raw mode and
/// group mixing is disabled.
pub struct FixturePlanState {
    path: PathBuf,
    active: Mutex<Option<FixturePlan>>,
}

impl FixturePlanState {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut active = None;
        if path.exists() {
            match std::fs::read_to_string(&path)
                .map_err(|err| err.to_string())
                .and_then(|data| {
                    serde_json::from_str::<FixturePlan>(&data).map_err(|err| err.to_string())
                }) {
                Ok(plan) => active = Some(plan),
                Err(err) => warn!("failed to load fixture plan from {}: {err}", path.display()),
            }
        }
        Self {
            path,
            active: Mutex::new(active),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.lock().unwrap().is_some()
    }

    pub fn preview(
        &self,
        xml_content: &str,
        source_filename: Option<&str>,
    ) -> Result<FixturePlanSummary, ControllerError> {
        let plan = parse_fixture_plan_xml(xml_content, source_filename)?;
        Ok(build_summary(&plan, false))
    }

    pub fn activate(
        &self,
        xml_content: &str,
        source_filename: Option<&str>,
    ) -> Result<FixturePlanSummary, ControllerError> {
        let plan = parse_fixture_plan_xml(xml_content, source_filename)?;
        write_json_file(&self.path, &plan)?;
        let summary = build_summary(&plan, true);
        *self.active.lock().unwrap() = Some(plan);
        Ok(summary)
    }

    pub fn clear(&self) -> Result<(), ControllerError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(ControllerError::Persistence(format!(
                    "{}: {err}",
                    self.path.display()
                )));
            }
        }
        *self.active.lock().unwrap() = None;
        Ok(())
    }

    pub fn summary(&self) -> FixturePlanSummary {
        match self.active.lock().unwrap().as_ref() {
            Some(plan) => build_summary(plan, true),
            None => FixturePlanSummary::default(),
        }
    }

    pub fn details(&self) -> FixturePlanDetails {
        match self.active.lock().unwrap().as_ref() {
            Some(plan) => FixturePlanDetails {
                active: true,
                source_filename: plan.source_filename.clone(),
                imported_at: Some(plan.imported_at.clone()),
                fixture_count: plan.fixture_count,
                parameter_count: plan.parameter_count,
                universes: plan.universes.iter().map(|u| u + 1).collect(),
                fixtures: plan.fixtures.clone(),
            },
            None => FixturePlanDetails::default(),
        }
    }

    pub fn lookup_parameter(&self, universe: u16, channel: u16) -> Option<FixtureParameter> {
        self.active
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|plan| plan.address_map.get(&address_key(universe, channel)).cloned())
    }

    /// All intensity-role addresses as `(universe, 1-based channel)`.
    /// `None` without an active plan, which selects raw master mode.
    pub fn intensity_addresses(&self) -> Option<HashSet<(u16, u16)>> {
        self.active.lock().unwrap().as_ref().map(|plan| {
            plan.address_map
                .values()
                .filter(|parameter| parameter.role == ParameterRole::Intensity)
                .map(|parameter| (parameter.universe, parameter.channel))
                .collect()
        })
    }

    pub fn with_plan<T>(&self, f: impl FnOnce(Option<&FixturePlan>) -> T) -> T {
        f(self.active.lock().unwrap().as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PLAN_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ParameterListExport>
  <Parameter universe="1" number="1" fixture="Spot 1" name="Dimmer"/>
  <Parameter universe="1" number="2" fixture="Spot 1" name="Color R"/>
  <Parameter universe="1" number="10" fixture="Spot 2" name="Dimmer"/>
  <Parameter universe="2" number="1" fixture="Wash 1" name="Pan"/>
</ParameterListExport>"#;

    #[test]
    fn parses_plan_and_infers_roles() {
        let plan = parse_fixture_plan_xml(PLAN_XML, Some("rig.xml")).unwrap();
        assert_eq!(plan.fixture_count, 3);
        assert_eq!(plan.parameter_count, 4);
        assert_eq!(plan.universes, vec![0, 1]);

        let dimmer = &plan.address_map["0:1"];
        assert_eq!(dimmer.role, ParameterRole::Intensity);
        assert_eq!(dimmer.ma3_universe, 1);
        assert_eq!(plan.address_map["0:2"].role, ParameterRole::Color);
        assert_eq!(plan.address_map["1:1"].role, ParameterRole::Position);
    }

    #[test]
    fn duplicate_address_is_rejected() {
        let xml = r#"<ParameterListExport>
  <Parameter universe="1" number="1" fixture="A" name="Dimmer"/>
  <Parameter universe="1" number="1" fixture="B" name="Dimmer"/>
</ParameterListExport>"#;
        assert!(matches!(
            parse_fixture_plan_xml(xml, None),
            Err(ControllerError::InvalidInput(_))
        ));
    }

    #[test]
    fn wrong_root_tag_is_rejected() {
        let xml = "<Rig><Parameter universe=\"1\" number=\"1\" fixture=\"A\" name=\"D\"/></Rig>";
        assert!(matches!(
            parse_fixture_plan_xml(xml, None),
            Err(ControllerError::InvalidInput(_))
        ));
    }

    #[test]
    fn out_of_range_attributes_are_rejected() {
        for (universe, number) in [("0", "1"), ("1", "0"), ("1", "513"), ("", "1"), ("1", "x")] {
            let xml = format!(
                "<ParameterListExport><Parameter universe={universe:?} number={number:?} \
                 fixture=\"A\" name=\"Dimmer\"/></ParameterListExport>"
            );
            assert!(parse_fixture_plan_xml(&xml, None).is_err(), "{universe}/{number}");
        }
    }

    #[test]
    fn role_inference_tokens() {
        assert_eq!(infer_role("Master Dimmer"), ParameterRole::Intensity);
        assert_eq!(infer_role("ColorRGB_G"), ParameterRole::Color);
        assert_eq!(infer_role("Tilt"), ParameterRole::Position);
        assert_eq!(infer_role("Gobo Wheel"), ParameterRole::Beam);
        assert_eq!(infer_role("Reset"), ParameterRole::Control);
        assert_eq!(infer_role("Mystery"), ParameterRole::Other);
    }

    #[test]
    fn activate_persists_and_reloads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fixture_plan.active.json");
        let state = FixturePlanState::load(&path);
        assert!(!state.is_active());
        assert!(state.intensity_addresses().is_none());

        let summary = state.activate(PLAN_XML, Some("rig.xml")).unwrap();
        assert!(summary.active);
        assert_eq!(summary.universes, vec![1, 2]);

        let addresses = state.intensity_addresses().unwrap();
        assert!(addresses.contains(&(0, 1)));
        assert!(addresses.contains(&(0, 10)));
        assert!(!addresses.contains(&(1, 1)));

        // A fresh state picks the plan up from disk.
        let reloaded = FixturePlanState::load(&path);
        assert!(reloaded.is_active());
        assert_eq!(
            reloaded.lookup_parameter(0, 2).unwrap().role,
            ParameterRole::Color
        );

        reloaded.clear().unwrap();
        assert!(!reloaded.is_active());
        assert!(!path.exists());
        reloaded.clear().unwrap(); // idempotent
    }
}
