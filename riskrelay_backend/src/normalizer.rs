//! Response normalizer: raw primary-agent payload → `RiskFlags`.
//!
//! Decoding runs an ordered list of named strategies. Each strategy is total and
//! returns `None` when the response does not have the shape it understands; the
//! first `Some` wins. When nothing matches the result is all-false.
//!
//! All-false on unknown shapes is a fail-open policy: an unrecognized response
//! reads as "no risk signal found", not as "no risk".

use serde_json::{Map, Value};

use crate::flags::{is_truthy, RiskFlag, RiskFlags};

/// Keyed map of named computations on the primary agent's reply.
const ACTION_RESULTS_FIELD: &str = "action_results";
/// List of discrete skill results.
const SKILL_RESULTS_FIELD: &str = "skillsResults";
/// Coordinator skill that consolidates every condition check.
const COORDINATOR_KEY: &str = "ConditionChecker";

/// One way of reading risk flags out of an agent response.
pub trait FlagDecoder: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` means "this shape is not mine", never an error.
    fn decode(&self, raw: &Value) -> Option<RiskFlags>;
}

/// Which strategy produced the flags, for logging and debugging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizedFlags {
    pub flags: RiskFlags,
    pub strategy: Option<&'static str>,
}

pub struct ResponseNormalizer {
    decoders: Vec<Box<dyn FlagDecoder>>,
}

impl Default for ResponseNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseNormalizer {
    pub fn new() -> Self {
        Self {
            decoders: vec![
                Box::new(SkillResultsFlags),
                Box::new(SkillResultsConditions),
                Box::new(CoordinatorFlags),
                Box::new(NamedFlagKeys),
                Box::new(AnyEntryFlags),
                Box::new(KeySubstringScan),
                Box::new(AmbiguousConditionCheck),
            ],
        }
    }

    pub fn with_decoders(decoders: Vec<Box<dyn FlagDecoder>>) -> Self {
        Self { decoders }
    }

    pub fn decoder_names(&self) -> Vec<&'static str> {
        self.decoders.iter().map(|d| d.name()).collect()
    }

    pub fn extract_flags(&self, raw: &Value) -> RiskFlags {
        self.normalize(raw).flags
    }

    pub fn normalize(&self, raw: &Value) -> NormalizedFlags {
        for decoder in &self.decoders {
            if let Some(flags) = decoder.decode(raw) {
                tracing::debug!(
                    "Flag decoder '{}' matched: {}",
                    decoder.name(),
                    flags.describe()
                );
                return NormalizedFlags {
                    flags,
                    strategy: Some(decoder.name()),
                };
            }
        }

        tracing::debug!("No flag decoder matched; defaulting to no flags");
        NormalizedFlags {
            flags: RiskFlags::none(),
            strategy: None,
        }
    }
}

/// Convenience entry point with the default decoder list.
pub fn extract_flags(raw: &Value) -> RiskFlags {
    ResponseNormalizer::new().extract_flags(raw)
}

/// `skillsResults[]` entry carrying a structured `result.flags` field.
pub struct SkillResultsFlags;

impl FlagDecoder for SkillResultsFlags {
    fn name(&self) -> &'static str {
        "skill_results_flags"
    }

    fn decode(&self, raw: &Value) -> Option<RiskFlags> {
        skill_results(raw)?
            .iter()
            .filter_map(|skill| skill.get("result")?.get("flags"))
            .find_map(RiskFlags::from_flags_field)
    }
}

/// `skillsResults[]` entries whose computed value is truthy and whose name
/// mentions a flag.
pub struct SkillResultsConditions;

impl FlagDecoder for SkillResultsConditions {
    fn name(&self) -> &'static str {
        "skill_results_conditions"
    }

    fn decode(&self, raw: &Value) -> Option<RiskFlags> {
        let mut flags = RiskFlags::none();
        for skill in skill_results(raw)? {
            let name = skill.get("name").and_then(Value::as_str).unwrap_or("");
            let computed = skill
                .get("output")
                .or_else(|| skill.get("result"))
                .unwrap_or(skill);
            if name.is_empty() || !is_truthy(computed) {
                continue;
            }
            for flag in RiskFlag::ALL {
                if flag
                    .name_fragments()
                    .iter()
                    .any(|fragment| name.contains(fragment))
                {
                    flags.set(flag, true);
                }
            }
        }
        flags.any().then_some(flags)
    }
}

/// The coordinator entry's consolidated `result.flags`.
pub struct CoordinatorFlags;

impl FlagDecoder for CoordinatorFlags {
    fn name(&self) -> &'static str {
        "coordinator_flags"
    }

    fn decode(&self, raw: &Value) -> Option<RiskFlags> {
        action_results(raw)?
            .get(COORDINATOR_KEY)
            .and_then(structured_flags)
            .and_then(RiskFlags::from_flags_field)
    }
}

/// The three canonical names used directly as `action_results` keys.
pub struct NamedFlagKeys;

impl FlagDecoder for NamedFlagKeys {
    fn name(&self) -> &'static str {
        "named_flag_keys"
    }

    fn decode(&self, raw: &Value) -> Option<RiskFlags> {
        let actions = action_results(raw)?;
        let mut flags = RiskFlags::none();
        for flag in RiskFlag::ALL {
            let hit = actions
                .get(flag.canonical_name())
                .map(is_truthy)
                .unwrap_or(false);
            flags.set(flag, hit);
        }
        flags.any().then_some(flags)
    }
}

/// Any other `action_results` entry exposing a `result.flags` field. Runs
/// after the named keys so an unrelated skill cannot mask a direct signal.
pub struct AnyEntryFlags;

impl FlagDecoder for AnyEntryFlags {
    fn name(&self) -> &'static str {
        "any_entry_flags"
    }

    fn decode(&self, raw: &Value) -> Option<RiskFlags> {
        action_results(raw)?
            .values()
            .filter_map(structured_flags)
            .find_map(RiskFlags::from_flags_field)
    }
}

/// Last resort: any truthy `action_results` entry whose key contains a
/// canonical flag name.
pub struct KeySubstringScan;

impl FlagDecoder for KeySubstringScan {
    fn name(&self) -> &'static str {
        "key_substring_scan"
    }

    fn decode(&self, raw: &Value) -> Option<RiskFlags> {
        Some(scan_named_entries(action_results(raw)?)).filter(RiskFlags::any)
    }
}

/// A bare `skills.CheckCondition` result says *something* fired but not which
/// category. That cannot be resolved, so it decodes to all-false explicitly.
pub struct AmbiguousConditionCheck;

impl FlagDecoder for AmbiguousConditionCheck {
    fn name(&self) -> &'static str {
        "ambiguous_condition_check"
    }

    fn decode(&self, raw: &Value) -> Option<RiskFlags> {
        let check = raw.get("skills")?.get("CheckCondition")?;
        let computed = check.get("output").unwrap_or(check);
        if !is_truthy(computed) {
            return None;
        }
        tracing::warn!(
            "Condition check fired without a named risk category; leaving all flags false"
        );
        Some(RiskFlags::none())
    }
}

/// OR every flag whose canonical name is a substring of a truthy entry's key.
pub fn scan_named_entries(entries: &Map<String, Value>) -> RiskFlags {
    let mut flags = RiskFlags::none();
    for (key, value) in entries {
        if !is_truthy(value) {
            continue;
        }
        for flag in RiskFlag::ALL {
            if key.contains(flag.canonical_name()) {
                flags.set(flag, true);
            }
        }
    }
    flags
}

fn action_results(raw: &Value) -> Option<&Map<String, Value>> {
    raw.get(ACTION_RESULTS_FIELD)?.as_object()
}

fn skill_results(raw: &Value) -> Option<&Vec<Value>> {
    raw.get(SKILL_RESULTS_FIELD)?.as_array()
}

fn structured_flags(entry: &Value) -> Option<&Value> {
    entry
        .get("result")
        .and_then(|result| result.get("flags"))
        .or_else(|| entry.get("output").and_then(|output| output.get("flags")))
        .filter(|flags| flags.is_array() || flags.is_object())
}
