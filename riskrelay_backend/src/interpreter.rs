//! Result interpreter: second-agent reply → text + optional `RiskAssessment`.
//!
//! The reply shape is not stable. Decoding tries, in order: a dedicated
//! structured field, a free-text content field (with an embedded fenced JSON
//! block), a breadth-first search for any content-like string, and finally a
//! JSON dump of the whole reply. Never fails.

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::OnceLock;

const STRUCTURED_FIELDS: &[&str] = &["json_content", "jsonContent", "structured_content"];
const CONTENT_FIELDS: &[&str] = &["content", "message", "text", "answer"];
const CONTENT_KEY_HINTS: &[&str] = &["content", "text", "message"];

const RISK_TYPE_KEYS: &[&str] = &["riskType", "tipo_riesgo", "tipo", "risk_type"];
const RISK_LEVEL_KEYS: &[&str] = &["riskLevel", "nivel_riesgo", "nivel", "risk_level"];
const RISK_PERCENTAGE_KEYS: &[&str] = &[
    "riskPercentage",
    "riesgo_porcentual",
    "porcentaje",
    "estimated_risk",
];
const JUSTIFICATION_KEYS: &[&str] = &["justification", "justificacion", "motivo", "why"];
const RECOMMENDATION_KEYS: &[&str] = &["recommendation", "recomendacion", "sugerencia"];
const SUGGESTED_REPLY_KEYS: &[&str] = &[
    "respuesta_usuario_sugerida",
    "respuesta_sugerida",
    "intervencion_sugerida",
    "respuesta_para_usuario",
    "respuesta",
];

/// Breadth-first search stops after visiting this many nodes.
const MAX_SEARCH_NODES: usize = 2_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessment {
    pub risk_type: String,
    pub risk_level: String,
    pub risk_percentage: Option<f64>,
    pub justification: String,
    pub recommendation: String,
}

impl RiskAssessment {
    /// Map a structured payload, accepting every known synonym per field.
    pub fn from_payload(payload: &Map<String, Value>) -> Self {
        Self {
            risk_type: first_text(payload, RISK_TYPE_KEYS),
            risk_level: first_text(payload, RISK_LEVEL_KEYS),
            risk_percentage: RISK_PERCENTAGE_KEYS
                .iter()
                .filter_map(|key| payload.get(*key))
                .find_map(parse_percentage),
            justification: first_text(payload, JUSTIFICATION_KEYS),
            recommendation: first_text(payload, RECOMMENDATION_KEYS),
        }
    }

    /// Assessment carrying only free text, kept as the justification.
    pub fn from_text(text: &str) -> Self {
        Self {
            justification: text.trim().to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterpretationSource {
    StructuredField,
    ContentField,
    DeepSearch,
    RawDump,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Interpretation {
    pub text: String,
    pub structured: Option<RiskAssessment>,
    /// The structured object the assessment was read from.
    pub payload: Option<Map<String, Value>>,
    pub source: InterpretationSource,
}

impl Interpretation {
    fn new(text: String, payload: Option<Map<String, Value>>, source: InterpretationSource) -> Self {
        Self {
            text,
            structured: payload.as_ref().map(RiskAssessment::from_payload),
            payload,
            source,
        }
    }

    pub fn assessment_or_fallback(&self) -> RiskAssessment {
        self.structured
            .clone()
            .unwrap_or_else(|| RiskAssessment::from_text(&self.text))
    }

    /// Text meant for the user in place of the primary agent's answer.
    pub fn suggested_reply(&self) -> Option<String> {
        let from_payload = self.payload.as_ref().and_then(|payload| {
            SUGGESTED_REPLY_KEYS
                .iter()
                .filter_map(|key| payload.get(*key).and_then(Value::as_str))
                .map(str::trim)
                .find(|value| !value.is_empty())
                .map(str::to_string)
        });
        from_payload.or_else(|| {
            let text = self.text.trim();
            (!text.is_empty()).then(|| text.to_string())
        })
    }
}

pub fn interpret(raw: &Value) -> Interpretation {
    if let Some(interpretation) = from_structured_field(raw) {
        return interpretation;
    }
    if let Some(text) = content_field(raw) {
        let payload = parse_embedded_json(&text);
        return Interpretation::new(text, payload, InterpretationSource::ContentField);
    }
    if let Some(text) = deep_search_text(raw) {
        let payload = parse_embedded_json(&text);
        return Interpretation::new(text, payload, InterpretationSource::DeepSearch);
    }

    tracing::debug!("No content found in agent reply; falling back to raw dump");
    let text = serde_json::to_string(raw).unwrap_or_default();
    Interpretation::new(text, None, InterpretationSource::RawDump)
}

/// Find a JSON object inside fenced code blocks, or a text that is itself a JSON object.
pub fn parse_embedded_json(text: &str) -> Option<Map<String, Value>> {
    if let Some(fence) = fence_regex() {
        for captures in fence.captures_iter(text) {
            if let Some(body) = captures.get(1) {
                if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body.as_str().trim()) {
                    return Some(map);
                }
            }
        }
    }

    match serde_json::from_str::<Value>(text.trim()) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn fence_regex() -> Option<&'static Regex> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    FENCE
        .get_or_init(|| Regex::new(r"(?s)```[A-Za-z]*[ \t]*\r?\n?(.*?)```").ok())
        .as_ref()
}

fn from_structured_field(raw: &Value) -> Option<Interpretation> {
    let holders = std::iter::once(raw)
        .chain(raw.get("result"))
        .chain(
            raw.get("skillsResults")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter_map(|skill| skill.get("result")),
        );

    for holder in holders {
        for field in STRUCTURED_FIELDS {
            let Some(value) = holder.get(field) else {
                continue;
            };
            let payload = match value {
                Value::Object(map) => Some(map.clone()),
                Value::String(s) => parse_embedded_json(s),
                _ => None,
            };
            if let Some(payload) = payload {
                let text = content_field(raw)
                    .unwrap_or_else(|| serde_json::to_string_pretty(&payload).unwrap_or_default());
                return Some(Interpretation::new(
                    text,
                    Some(payload),
                    InterpretationSource::StructuredField,
                ));
            }
        }
    }
    None
}

fn content_field(raw: &Value) -> Option<String> {
    std::iter::once(raw)
        .chain(raw.get("result"))
        .flat_map(|holder| CONTENT_FIELDS.iter().filter_map(move |f| holder.get(*f)))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|text| !text.is_empty())
        .map(str::to_string)
}

fn deep_search_text(raw: &Value) -> Option<String> {
    let mut queue: VecDeque<&Value> = VecDeque::from([raw]);
    let mut visited = 0usize;

    while let Some(node) = queue.pop_front() {
        visited += 1;
        if visited > MAX_SEARCH_NODES {
            break;
        }
        match node {
            Value::Object(map) => {
                for (key, value) in map {
                    if let Value::String(text) = value {
                        if looks_like_content_key(key) && is_meaningful_text(text) {
                            return Some(text.trim().to_string());
                        }
                    } else {
                        queue.push_back(value);
                    }
                }
            }
            Value::Array(items) => queue.extend(items.iter()),
            _ => {}
        }
    }
    None
}

fn looks_like_content_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    CONTENT_KEY_HINTS.iter().any(|hint| key.contains(hint))
}

// Condition results also live under `content`; a bare boolean string is not an answer.
fn is_meaningful_text(text: &str) -> bool {
    let text = text.trim();
    !text.is_empty() && !text.eq_ignore_ascii_case("true") && !text.eq_ignore_ascii_case("false")
}

fn first_text(payload: &Map<String, Value>, keys: &[&str]) -> String {
    keys.iter()
        .filter_map(|key| payload.get(*key))
        .filter_map(|value| match value {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .find(|s| !s.is_empty())
        .unwrap_or_default()
}

fn parse_percentage(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s
            .trim()
            .trim_end_matches('%')
            .trim()
            .replace(',', ".")
            .parse::<f64>()
            .ok(),
        _ => None,
    }
}
