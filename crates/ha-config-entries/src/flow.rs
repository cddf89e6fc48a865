//! Config Flow framework
//!
//! A config flow is a multi-step form wizard. Each step either shows a
//! form, finishes by creating a config entry, or aborts. Native flows
//! implement [`ConfigFlow`] and are driven by the
//! [`FlowManager`](crate::flow_manager::FlowManager).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::entry::ConfigEntrySource;

/// User input submitted for a step
pub type FlowInput = serde_json::Map<String, serde_json::Value>;

/// Abort reason when the unique id already belongs to an entry
pub const ABORT_ALREADY_CONFIGURED: &str = "already_configured";
/// Abort reason when another running flow claimed the unique id
pub const ABORT_ALREADY_IN_PROGRESS: &str = "already_in_progress";

/// Form field schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    /// Allowed values for a `select` field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

impl FormField {
    /// A required free-text field
    pub fn required_string(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: "string".to_string(),
            required: Some(true),
            options: None,
        }
    }

    /// A required field restricted to `options`
    pub fn required_select(name: impl Into<String>, options: Vec<String>) -> Self {
        Self {
            name: name.into(),
            field_type: "select".to_string(),
            required: Some(true),
            options: Some(options),
        }
    }
}

/// Input rejected by a form schema
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("required key not provided: {0}")]
    MissingField(String),

    #[error("expected str for {0}")]
    NotAString(String),

    #[error("value must be one of {options:?} for {field}")]
    NotInOptions { field: String, options: Vec<String> },
}

/// Check `input` against a form schema.
///
/// Keys not named by the schema are dropped from the returned input.
pub fn validate_input(schema: &[FormField], input: &FlowInput) -> Result<FlowInput, SchemaError> {
    let mut validated = FlowInput::new();

    for field in schema {
        let value = match input.get(&field.name) {
            Some(value) => value,
            None if field.required.unwrap_or(false) => {
                return Err(SchemaError::MissingField(field.name.clone()))
            }
            None => continue,
        };

        let text = value
            .as_str()
            .ok_or_else(|| SchemaError::NotAString(field.name.clone()))?;

        if let Some(ref options) = field.options {
            if !options.iter().any(|option| option == text) {
                return Err(SchemaError::NotInOptions {
                    field: field.name.clone(),
                    options: options.clone(),
                });
            }
        }

        validated.insert(field.name.clone(), value.clone());
    }

    Ok(validated)
}

/// Outcome of one flow step
#[derive(Debug, Clone, PartialEq)]
pub enum FlowStep {
    Form {
        step_id: String,
        data_schema: Vec<FormField>,
        errors: HashMap<String, String>,
        description_placeholders: HashMap<String, String>,
        last_step: Option<bool>,
    },
    CreateEntry {
        title: String,
        data: HashMap<String, serde_json::Value>,
    },
    Abort {
        reason: String,
    },
}

impl FlowStep {
    pub fn form(step_id: impl Into<String>, data_schema: Vec<FormField>) -> Self {
        FlowStep::Form {
            step_id: step_id.into(),
            data_schema,
            errors: HashMap::new(),
            description_placeholders: HashMap::new(),
            last_step: None,
        }
    }

    /// Attach errors to a form; no effect on other step kinds
    pub fn with_errors(mut self, new_errors: HashMap<String, String>) -> Self {
        if let FlowStep::Form { ref mut errors, .. } = self {
            *errors = new_errors;
        }
        self
    }

    pub fn create_entry(
        title: impl Into<String>,
        data: HashMap<String, serde_json::Value>,
    ) -> Self {
        FlowStep::CreateEntry {
            title: title.into(),
            data,
        }
    }

    pub fn abort(reason: impl Into<String>) -> Self {
        FlowStep::Abort {
            reason: reason.into(),
        }
    }
}

/// Errors a step can raise instead of returning a [`FlowStep`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FlowError {
    /// Ends the flow with an abort result
    #[error("flow aborted: {0}")]
    Abort(String),

    #[error("unknown step: {0}")]
    UnknownStep(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Answers whether a unique id is already taken by a stored entry
pub trait UniqueIdLookup: Send + Sync {
    fn is_configured(&self, domain: &str, unique_id: &str) -> bool;
}

/// Unique ids claimed by flows that are still running.
///
/// Maps (domain, unique_id) to the claiming flow_id.
#[derive(Debug, Default)]
pub struct UniqueIdClaims {
    claims: DashMap<(String, String), String>,
}

impl UniqueIdClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `unique_id` for `flow_id`. Fails if another flow holds it.
    fn claim(&self, domain: &str, unique_id: &str, flow_id: &str) -> bool {
        let key = (domain.to_string(), unique_id.to_string());
        let holder = self
            .claims
            .entry(key)
            .or_insert_with(|| flow_id.to_string());
        holder.value() == flow_id
    }

    /// Drop every claim held by `flow_id`
    pub fn release_flow(&self, flow_id: &str) {
        self.claims.retain(|_, holder| holder.as_str() != flow_id);
    }

    pub fn is_claimed(&self, domain: &str, unique_id: &str) -> bool {
        self.claims
            .contains_key(&(domain.to_string(), unique_id.to_string()))
    }
}

/// Per-flow context handed to each step
pub struct FlowContext {
    pub flow_id: String,
    pub handler: String,
    pub source: ConfigEntrySource,
    unique_id: Option<String>,
    configured: Arc<dyn UniqueIdLookup>,
    claims: Arc<UniqueIdClaims>,
}

impl FlowContext {
    pub fn new(
        flow_id: impl Into<String>,
        handler: impl Into<String>,
        source: ConfigEntrySource,
        configured: Arc<dyn UniqueIdLookup>,
        claims: Arc<UniqueIdClaims>,
    ) -> Self {
        Self {
            flow_id: flow_id.into(),
            handler: handler.into(),
            source,
            unique_id: None,
            configured,
            claims,
        }
    }

    pub fn unique_id(&self) -> Option<&str> {
        self.unique_id.as_deref()
    }

    /// Set the flow's unique id, aborting if another running flow owns it.
    pub fn set_unique_id(&mut self, unique_id: impl Into<String>) -> Result<(), FlowError> {
        let unique_id = unique_id.into();

        self.claims.release_flow(&self.flow_id);
        if !self.claims.claim(&self.handler, &unique_id, &self.flow_id) {
            // The previous id was released above, so the flow no longer owns it
            self.unique_id = None;
            return Err(FlowError::Abort(ABORT_ALREADY_IN_PROGRESS.to_string()));
        }

        self.unique_id = Some(unique_id);
        Ok(())
    }

    /// Abort if a stored entry already uses this flow's unique id.
    pub fn abort_if_unique_id_configured(&self) -> Result<(), FlowError> {
        match self.unique_id {
            Some(ref unique_id) if self.configured.is_configured(&self.handler, unique_id) => {
                Err(FlowError::Abort(ABORT_ALREADY_CONFIGURED.to_string()))
            }
            _ => Ok(()),
        }
    }
}

/// A native config flow handler
#[async_trait]
pub trait ConfigFlow: Send {
    /// Major version of entries this flow creates
    fn version(&self) -> u32 {
        1
    }

    /// Minor version of entries this flow creates
    fn minor_version(&self) -> u32 {
        1
    }

    /// Run `step_id` with the (already schema-validated) input
    async fn async_step(
        &mut self,
        ctx: &mut FlowContext,
        step_id: &str,
        user_input: Option<FlowInput>,
    ) -> Result<FlowStep, FlowError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    struct Configured(HashSet<(String, String)>);

    impl UniqueIdLookup for Configured {
        fn is_configured(&self, domain: &str, unique_id: &str) -> bool {
            self.0.contains(&(domain.to_string(), unique_id.to_string()))
        }
    }

    fn context(flow_id: &str, claims: Arc<UniqueIdClaims>) -> FlowContext {
        let mut configured = HashSet::new();
        configured.insert(("wolflink".to_string(), "7".to_string()));
        FlowContext::new(
            flow_id,
            "wolflink",
            ConfigEntrySource::User,
            Arc::new(Configured(configured)),
            claims,
        )
    }

    fn input(value: serde_json::Value) -> FlowInput {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_validate_required_strings() {
        let schema = vec![
            FormField::required_string("username"),
            FormField::required_string("password"),
        ];

        let ok = validate_input(
            &schema,
            &input(json!({"username": "u", "password": "p", "extra": 1})),
        )
        .unwrap();
        assert_eq!(ok.len(), 2);
        assert!(!ok.contains_key("extra"));

        let missing = validate_input(&schema, &input(json!({"username": "u"})));
        assert_eq!(
            missing,
            Err(SchemaError::MissingField("password".to_string()))
        );

        let wrong_type =
            validate_input(&schema, &input(json!({"username": 1, "password": "p"})));
        assert_eq!(
            wrong_type,
            Err(SchemaError::NotAString("username".to_string()))
        );
    }

    #[test]
    fn test_validate_select() {
        let schema = vec![FormField::required_select(
            "device_name",
            vec!["Boiler1".to_string()],
        )];

        assert!(validate_input(&schema, &input(json!({"device_name": "Boiler1"}))).is_ok());
        assert!(matches!(
            validate_input(&schema, &input(json!({"device_name": "Other"}))),
            Err(SchemaError::NotInOptions { .. })
        ));
    }

    #[test]
    fn test_form_with_errors() {
        let mut errors = HashMap::new();
        errors.insert("base".to_string(), "invalid_auth".to_string());

        match FlowStep::form("user", vec![]).with_errors(errors) {
            FlowStep::Form { errors, .. } => assert_eq!(errors["base"], "invalid_auth"),
            other => panic!("expected form, got {:?}", other),
        }

        assert_eq!(
            FlowStep::abort("x").with_errors(HashMap::new()),
            FlowStep::abort("x")
        );
    }

    #[test]
    fn test_abort_if_configured() {
        let claims = Arc::new(UniqueIdClaims::new());
        let mut ctx = context("flow1", claims);

        // No unique id set yet
        assert!(ctx.abort_if_unique_id_configured().is_ok());

        ctx.set_unique_id("42").unwrap();
        assert!(ctx.abort_if_unique_id_configured().is_ok());

        ctx.set_unique_id("7").unwrap();
        assert_eq!(
            ctx.abort_if_unique_id_configured(),
            Err(FlowError::Abort("already_configured".to_string()))
        );
    }

    #[test]
    fn test_unique_id_claimed_by_other_flow() {
        let claims = Arc::new(UniqueIdClaims::new());
        let mut first = context("flow1", claims.clone());
        let mut second = context("flow2", claims.clone());

        first.set_unique_id("42").unwrap();
        assert_eq!(
            second.set_unique_id("42"),
            Err(FlowError::Abort("already_in_progress".to_string()))
        );
        assert_eq!(second.unique_id(), None);

        // Re-claiming from the same flow is fine, and moving releases the old id
        first.set_unique_id("42").unwrap();
        first.set_unique_id("43").unwrap();
        assert!(!claims.is_claimed("wolflink", "42"));
        second.set_unique_id("42").unwrap();

        claims.release_flow("flow2");
        assert!(!claims.is_claimed("wolflink", "42"));
        assert!(claims.is_claimed("wolflink", "43"));
    }

    #[test]
    fn test_failed_claim_clears_unique_id() {
        let claims = Arc::new(UniqueIdClaims::new());
        let mut first = context("flow1", claims.clone());
        let mut second = context("flow2", claims.clone());

        first.set_unique_id("42").unwrap();
        second.set_unique_id("7").unwrap();

        assert_eq!(
            second.set_unique_id("42"),
            Err(FlowError::Abort("already_in_progress".to_string()))
        );
        assert_eq!(second.unique_id(), None);
        assert!(!claims.is_claimed("wolflink", "7"));
        assert!(second.abort_if_unique_id_configured().is_ok());
        assert_eq!(first.unique_id(), Some("42"));
    }
}
