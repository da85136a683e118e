//! Risk flag model shared by the normalizer, the stream reader and the orchestrator.
//!
//! A `RiskFlags` record is always fully populated: absence of evidence is `false`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Nested objects are followed at most this deep when deciding truthiness.
const MAX_TRUTHY_DEPTH: usize = 4;

/// Fields that may carry a computed condition result on an agent skill object.
const TRUTHY_FIELDS: [&str; 4] = ["json_content", "content", "output", "result"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFlag {
    SuicidalTendency,
    ClinicalAlarm,
    ExtremeViolence,
}

impl RiskFlag {
    pub const ALL: [RiskFlag; 3] = [
        RiskFlag::SuicidalTendency,
        RiskFlag::ClinicalAlarm,
        RiskFlag::ExtremeViolence,
    ];

    /// Skill name the primary agent uses for this flag.
    pub fn canonical_name(self) -> &'static str {
        match self {
            RiskFlag::SuicidalTendency => "TendenciaSuicida",
            RiskFlag::ClinicalAlarm => "PautasDeAlarmaClinicas",
            RiskFlag::ExtremeViolence => "ViolenciaRiesgoExtremo",
        }
    }

    /// Looser name fragments seen on skill result lists.
    pub fn name_fragments(self) -> &'static [&'static str] {
        match self {
            RiskFlag::SuicidalTendency => &["TendenciaSuicida"],
            RiskFlag::ClinicalAlarm => &["PautasDeAlarmaClinicas"],
            RiskFlag::ExtremeViolence => &["ViolenciaRiesgoExtremo", "Violencia", "RiesgoExtremo"],
        }
    }

    pub fn from_canonical_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|flag| flag.canonical_name() == name)
    }
}

impl fmt::Display for RiskFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.canonical_name())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskFlags {
    pub suicidal_tendency: bool,
    pub clinical_alarm: bool,
    pub extreme_violence: bool,
}

impl RiskFlags {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn get(&self, flag: RiskFlag) -> bool {
        match flag {
            RiskFlag::SuicidalTendency => self.suicidal_tendency,
            RiskFlag::ClinicalAlarm => self.clinical_alarm,
            RiskFlag::ExtremeViolence => self.extreme_violence,
        }
    }

    pub fn set(&mut self, flag: RiskFlag, value: bool) {
        match flag {
            RiskFlag::SuicidalTendency => self.suicidal_tendency = value,
            RiskFlag::ClinicalAlarm => self.clinical_alarm = value,
            RiskFlag::ExtremeViolence => self.extreme_violence = value,
        }
    }

    pub fn with(mut self, flag: RiskFlag) -> Self {
        self.set(flag, true);
        self
    }

    pub fn any(&self) -> bool {
        self.suicidal_tendency || self.clinical_alarm || self.extreme_violence
    }

    pub fn union(self, other: RiskFlags) -> RiskFlags {
        RiskFlags {
            suicidal_tendency: self.suicidal_tendency || other.suicidal_tendency,
            clinical_alarm: self.clinical_alarm || other.clinical_alarm,
            extreme_violence: self.extreme_violence || other.extreme_violence,
        }
    }

    pub fn active(&self) -> Vec<RiskFlag> {
        RiskFlag::ALL
            .into_iter()
            .filter(|flag| self.get(*flag))
            .collect()
    }

    /// Comma-joined canonical names of the active flags, `-` when none are set.
    pub fn describe(&self) -> String {
        let names: Vec<&str> = self
            .active()
            .into_iter()
            .map(RiskFlag::canonical_name)
            .collect();
        if names.is_empty() {
            "-".to_string()
        } else {
            names.join(", ")
        }
    }

    /// Decode a structured `flags` field: a map of named booleans or an array of names.
    /// Returns `None` for any other shape.
    pub fn from_flags_field(value: &Value) -> Option<RiskFlags> {
        match value {
            Value::Array(items) => {
                let mut flags = RiskFlags::none();
                for name in items.iter().filter_map(Value::as_str) {
                    if let Some(flag) = RiskFlag::from_canonical_name(name) {
                        flags.set(flag, true);
                    }
                }
                Some(flags)
            }
            Value::Object(map) => {
                let mut flags = RiskFlags::none();
                for flag in RiskFlag::ALL {
                    let hit = map
                        .get(flag.canonical_name())
                        .map(is_truthy)
                        .unwrap_or(false);
                    flags.set(flag, hit);
                }
                Some(flags)
            }
            _ => None,
        }
    }
}

/// Whether a JSON value encodes a positive condition result.
///
/// Recognized encodings: `true`, `"true"`, or an object whose
/// `json_content`/`content`/`output`/`result` is itself truthy.
pub fn is_truthy(value: &Value) -> bool {
    truthy_at_depth(value, 0)
}

fn truthy_at_depth(value: &Value, depth: usize) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => s.trim().eq_ignore_ascii_case("true"),
        Value::Object(map) if depth < MAX_TRUTHY_DEPTH => TRUTHY_FIELDS
            .iter()
            .filter_map(|field| map.get(*field))
            .any(|inner| truthy_at_depth(inner, depth + 1)),
        _ => false,
    }
}
