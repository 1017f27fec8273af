//! Step definitions
//!
//! A step is a reusable unit of computation registered in the catalog and
//! invoked over HTTP (sync or async) or in-process (script). Its attribute
//! specs declare which named values it consumes and produces.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::validate_step_id;

// =============================================================================
// Errors
// =============================================================================

/// Structural validation failures for a step definition
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StepError {
    /// Step id is not a slug
    #[error("invalid step id '{0}'")]
    InvalidId(String),

    /// Step declares no output attribute
    #[error("step '{0}' declares no output attribute")]
    NoOutputs(String),

    /// HTTP endpoint missing or empty
    #[error("step '{0}' has no http endpoint")]
    MissingEndpoint(String),

    /// Script language is not supported
    #[error("step '{0}' uses unsupported script language '{1}'")]
    UnsupportedLanguage(String, String),

    /// More than one input is marked for fan-out
    #[error("step '{0}' marks more than one input for fan-out")]
    MultipleFanout(String),

    /// A fan-out input must be list-typed
    #[error("step '{0}' marks non-list input '{1}' for fan-out")]
    FanoutNotList(String, String),

    /// Output attributes cannot fan out
    #[error("step '{0}' marks output '{1}' for fan-out")]
    FanoutOnOutput(String, String),
}

// =============================================================================
// Attribute Specs
// =============================================================================

/// Role an attribute plays for a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeRole {
    /// Input that must be present before the step can start
    Required,
    /// Input that is projected when present but never gates dispatch
    Optional,
    /// Value the step publishes on completion
    Output,
}

impl AttributeRole {
    /// Whether this role is an input to the step
    #[must_use]
    pub fn is_input(self) -> bool {
        matches!(self, Self::Required | Self::Optional)
    }
}

/// Coarse value type carried by an attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    String,
    Number,
    Boolean,
    List,
    Object,
    #[default]
    Any,
}

/// Declaration of one attribute consumed or produced by a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSpec {
    /// Role of the attribute for this step
    pub role: AttributeRole,

    /// Declared value type
    #[serde(rename = "type", default)]
    pub value_type: ValueType,

    /// When true on a list-typed input, each element becomes one work item
    #[serde(default)]
    pub fanout: bool,
}

impl AttributeSpec {
    /// A required input of the given type
    #[must_use]
    pub fn required(value_type: ValueType) -> Self {
        Self {
            role: AttributeRole::Required,
            value_type,
            fanout: false,
        }
    }

    /// An optional input of the given type
    #[must_use]
    pub fn optional(value_type: ValueType) -> Self {
        Self {
            role: AttributeRole::Optional,
            value_type,
            fanout: false,
        }
    }

    /// An output of the given type
    #[must_use]
    pub fn output(value_type: ValueType) -> Self {
        Self {
            role: AttributeRole::Output,
            value_type,
            fanout: false,
        }
    }

    /// Mark this (input) spec for fan-out
    #[must_use]
    pub fn with_fanout(mut self) -> Self {
        self.fanout = true;
        self
    }
}

// =============================================================================
// Step Kind
// =============================================================================

/// How a step endpoint is reached over HTTP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Invocation endpoint, POSTed with a JSON body
    pub endpoint: String,

    /// Optional liveness probe URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<String>,

    /// Request timeout in seconds; the invoker default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// In-process script payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptSpec {
    /// Script language; currently only `lua`
    pub language: String,

    /// Script source text
    pub source: String,
}

/// Script languages the engine can execute
pub const SUPPORTED_SCRIPT_LANGUAGES: &[&str] = &["lua"];

/// The three invocation modes of a step
///
/// Tagged so a new kind is an additive change matched exhaustively by the
/// invoker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// Request/response HTTP invocation
    Sync { http: HttpConfig },

    /// HTTP dispatch with webhook callback completion
    Async { http: HttpConfig },

    /// In-process script execution
    Script { script: ScriptSpec },
}

impl StepKind {
    /// Kind name as used in serialized form
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sync { .. } => "sync",
            Self::Async { .. } => "async",
            Self::Script { .. } => "script",
        }
    }

    /// HTTP config, when this kind has one
    #[must_use]
    pub fn http(&self) -> Option<&HttpConfig> {
        match self {
            Self::Sync { http } | Self::Async { http } => Some(http),
            Self::Script { .. } => None,
        }
    }

    /// Script spec, when this kind has one
    #[must_use]
    pub fn script(&self) -> Option<&ScriptSpec> {
        match self {
            Self::Script { script } => Some(script),
            _ => None,
        }
    }

    /// Whether completions arrive via webhook work items
    #[must_use]
    pub fn is_async(&self) -> bool {
        matches!(self, Self::Async { .. })
    }
}

// =============================================================================
// Step
// =============================================================================

/// A catalog-registered step definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Unique slug within the catalog
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Invocation mode and its payload
    #[serde(flatten)]
    pub kind: StepKind,

    /// Attribute name to spec mapping
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeSpec>,
}

impl Step {
    /// Names of input attributes (required and optional), sorted
    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.attributes
            .iter()
            .filter(|(_, spec)| spec.role.is_input())
            .map(|(name, _)| name.as_str())
    }

    /// Names of required input attributes, sorted
    pub fn required_input_names(&self) -> impl Iterator<Item = &str> {
        self.attributes
            .iter()
            .filter(|(_, spec)| spec.role == AttributeRole::Required)
            .map(|(name, _)| name.as_str())
    }

    /// Names of optional input attributes, sorted
    pub fn optional_input_names(&self) -> impl Iterator<Item = &str> {
        self.attributes
            .iter()
            .filter(|(_, spec)| spec.role == AttributeRole::Optional)
            .map(|(name, _)| name.as_str())
    }

    /// Names of output attributes, sorted
    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.attributes
            .iter()
            .filter(|(_, spec)| spec.role == AttributeRole::Output)
            .map(|(name, _)| name.as_str())
    }

    /// Whether this step lists the attribute as an output
    #[must_use]
    pub fn produces(&self, attribute: &str) -> bool {
        self.attributes
            .get(attribute)
            .is_some_and(|spec| spec.role == AttributeRole::Output)
    }

    /// The fan-out input, if one is declared
    #[must_use]
    pub fn fanout_input(&self) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(_, spec)| spec.fanout && spec.role.is_input())
            .map(|(name, _)| name.as_str())
    }

    /// Validate structural invariants of the definition.
    ///
    /// Script compilation is checked separately by the engine at
    /// registration time.
    pub fn validate(&self) -> Result<(), StepError> {
        validate_step_id(&self.id).map_err(|_| StepError::InvalidId(self.id.clone()))?;

        if self.output_names().next().is_none() {
            return Err(StepError::NoOutputs(self.id.clone()));
        }

        if let Some(http) = self.kind.http() {
            if http.endpoint.trim().is_empty() {
                return Err(StepError::MissingEndpoint(self.id.clone()));
            }
        }

        if let Some(script) = self.kind.script() {
            if !SUPPORTED_SCRIPT_LANGUAGES.contains(&script.language.as_str()) {
                return Err(StepError::UnsupportedLanguage(
                    self.id.clone(),
                    script.language.clone(),
                ));
            }
        }

        let mut fanout_seen = false;
        for (name, spec) in &self.attributes {
            if !spec.fanout {
                continue;
            }
            if spec.role == AttributeRole::Output {
                return Err(StepError::FanoutOnOutput(self.id.clone(), name.clone()));
            }
            if spec.value_type != ValueType::List {
                return Err(StepError::FanoutNotList(self.id.clone(), name.clone()));
            }
            if fanout_seen {
                return Err(StepError::MultipleFanout(self.id.clone()));
            }
            fanout_seen = true;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync_step(id: &str) -> Step {
        Step {
            id: id.to_string(),
            name: id.to_string(),
            kind: StepKind::Sync {
                http: HttpConfig {
                    endpoint: "http://svc/run".to_string(),
                    health_check: None,
                    timeout_secs: None,
                },
            },
            attributes: BTreeMap::from([(
                "out".to_string(),
                AttributeSpec::output(ValueType::String),
            )]),
        }
    }

    #[test]
    fn test_valid_sync_step() {
        assert!(sync_step("greet").validate().is_ok());
    }

    #[test]
    fn test_step_requires_an_output() {
        let mut step = sync_step("greet");
        step.attributes = BTreeMap::from([(
            "name".to_string(),
            AttributeSpec::required(ValueType::String),
        )]);
        assert_eq!(
            step.validate(),
            Err(StepError::NoOutputs("greet".to_string()))
        );
    }

    #[test]
    fn test_empty_endpoint_rejected() {
        let mut step = sync_step("greet");
        step.kind = StepKind::Async {
            http: HttpConfig {
                endpoint: "  ".to_string(),
                health_check: None,
                timeout_secs: None,
            },
        };
        assert_eq!(
            step.validate(),
            Err(StepError::MissingEndpoint("greet".to_string()))
        );
    }

    #[test]
    fn test_unsupported_language_rejected() {
        let mut step = sync_step("calc");
        step.kind = StepKind::Script {
            script: ScriptSpec {
                language: "cobol".to_string(),
                source: "return {}".to_string(),
            },
        };
        assert!(matches!(
            step.validate(),
            Err(StepError::UnsupportedLanguage(_, _))
        ));
    }

    #[test]
    fn test_fanout_rules() {
        let mut step = sync_step("mapper");
        step.attributes.insert(
            "items".to_string(),
            AttributeSpec::required(ValueType::List).with_fanout(),
        );
        assert!(step.validate().is_ok());
        assert_eq!(step.fanout_input(), Some("items"));

        // A second fan-out input is rejected
        step.attributes.insert(
            "more".to_string(),
            AttributeSpec::required(ValueType::List).with_fanout(),
        );
        assert_eq!(
            step.validate(),
            Err(StepError::MultipleFanout("mapper".to_string()))
        );

        // Fan-out on a scalar input is rejected
        let mut step = sync_step("mapper");
        step.attributes.insert(
            "item".to_string(),
            AttributeSpec::required(ValueType::String).with_fanout(),
        );
        assert!(matches!(
            step.validate(),
            Err(StepError::FanoutNotList(_, _))
        ));
    }

    #[test]
    fn test_kind_serialization_tags() {
        let step = sync_step("greet");
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["kind"], "sync");
        assert_eq!(json["http"]["endpoint"], "http://svc/run");

        let parsed: Step = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, step);
    }
}
