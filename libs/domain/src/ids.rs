//! Flow and step identifier handling
//!
//! Flow ids are user-supplied and sanitized into a predictable slug form;
//! step ids must already be slugs and are rejected otherwise.

use thiserror::Error;

/// Errors produced by identifier validation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// Flow id is empty after sanitization
    #[error("flow id '{0}' is empty after sanitization")]
    EmptyFlowId(String),

    /// Step id contains characters outside the slug alphabet
    #[error("invalid step id '{0}': expected lowercase slug [a-z0-9_.-]")]
    InvalidStepId(String),
}

/// Sanitize a user-supplied flow id into its canonical form.
///
/// Lowercases, strips characters outside `[a-z0-9_.\-+ ]`, replaces spaces
/// with `-`, and trims leading/trailing `-`. Idempotent: sanitizing an
/// already-sanitized id returns it unchanged.
#[must_use]
pub fn sanitize_flow_id(raw: &str) -> String {
    let kept: String = raw
        .to_lowercase()
        .chars()
        .filter(|c| matches!(c, 'a'..='z' | '0'..='9' | '_' | '.' | '-' | '+' | ' '))
        .map(|c| if c == ' ' { '-' } else { c })
        .collect();

    kept.trim_matches('-').to_string()
}

/// Sanitize a flow id, failing if nothing survives.
pub fn flow_id(raw: &str) -> Result<String, IdError> {
    let id = sanitize_flow_id(raw);
    if id.is_empty() {
        return Err(IdError::EmptyFlowId(raw.to_string()));
    }
    Ok(id)
}

/// Validate a step id is a well-formed slug.
pub fn validate_step_id(id: &str) -> Result<(), IdError> {
    let ok = !id.is_empty()
        && id
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '_' | '.' | '-'));
    if ok {
        Ok(())
    } else {
        Err(IdError::InvalidStepId(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_lowercases_and_strips() {
        assert_eq!(sanitize_flow_id("My Flow #1!"), "my-flow-1");
        assert_eq!(sanitize_flow_id("wf_2.0+beta"), "wf_2.0+beta");
        assert_eq!(sanitize_flow_id("--edge--"), "edge");
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let cases = ["My Flow #1!", "  spaced  out  ", "UPPER", "a-b_c.d+e"];
        for raw in cases {
            let once = sanitize_flow_id(raw);
            assert_eq!(sanitize_flow_id(&once), once, "not idempotent for {raw:?}");
        }
    }

    #[test]
    fn test_empty_after_sanitize_is_rejected() {
        assert!(matches!(flow_id("!!!"), Err(IdError::EmptyFlowId(_))));
        assert!(matches!(flow_id(""), Err(IdError::EmptyFlowId(_))));
        assert_eq!(flow_id("ok").unwrap(), "ok");
    }

    #[test]
    fn test_step_id_slug_rules() {
        assert!(validate_step_id("fetch-user").is_ok());
        assert!(validate_step_id("step_2.v1").is_ok());
        assert!(validate_step_id("Fetch").is_err());
        assert!(validate_step_id("a b").is_err());
        assert!(validate_step_id("").is_err());
    }
}
