//! Config Flow Manager
//!
//! Drives native config flows for the frontend: starts them, feeds them
//! validated user input, and persists the config entry a finished flow
//! produces.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::entry::{ConfigEntry, ConfigEntrySource};
use crate::flow::{
    validate_input, ConfigFlow, FlowContext, FlowError, FlowInput, FlowStep, FormField,
    SchemaError, UniqueIdClaims, ABORT_ALREADY_CONFIGURED,
};
use crate::manager::{ConfigEntries, ConfigEntriesError};

/// Builds a fresh flow instance for one setup session
pub type FlowFactory = Arc<dyn Fn() -> Box<dyn ConfigFlow> + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum FlowManagerError {
    #[error("No config flow handler registered for domain '{0}'")]
    UnknownHandler(String),

    #[error("Flow {0} not found")]
    UnknownFlow(String),

    #[error("Invalid user input: {0}")]
    InvalidData(#[from] SchemaError),

    #[error(transparent)]
    Flow(#[from] FlowError),

    #[error(transparent)]
    Entries(#[from] ConfigEntriesError),
}

pub type FlowManagerResult<T> = Result<T, FlowManagerError>;

/// Kind of a flow result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowResultType {
    Form,
    CreateEntry,
    Abort,
}

/// Result of a config flow step, as sent to the frontend
#[derive(Debug, Clone, Serialize)]
pub struct FlowResult {
    pub flow_id: String,
    /// Integration domain
    pub handler: String,
    #[serde(rename = "type")]
    pub result_type: FlowResultType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Always present, empty if no schema
    pub data_schema: Vec<FormField>,
    pub errors: Option<HashMap<String, String>>,
    pub description_placeholders: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minor_version: Option<u32>,
    /// The created entry (for create_entry)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub last_step: Option<bool>,
}

impl FlowResult {
    fn base(flow_id: &str, handler: &str, result_type: FlowResultType) -> Self {
        Self {
            flow_id: flow_id.to_string(),
            handler: handler.to_string(),
            result_type,
            step_id: None,
            data_schema: Vec::new(),
            errors: None,
            description_placeholders: None,
            title: None,
            reason: None,
            version: None,
            minor_version: None,
            result: None,
            last_step: None,
        }
    }

    fn abort(flow_id: &str, handler: &str, reason: String) -> Self {
        Self {
            reason: Some(reason),
            ..Self::base(flow_id, handler, FlowResultType::Abort)
        }
    }

    fn is_finished(&self) -> bool {
        self.result_type != FlowResultType::Form
    }
}

fn non_empty(map: HashMap<String, String>) -> Option<HashMap<String, String>> {
    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

/// Active flow state
struct ActiveFlow {
    flow: Box<dyn ConfigFlow>,
    ctx: FlowContext,
    /// Step the next submission goes to
    current_step: String,
    /// Schema of the form currently shown
    data_schema: Vec<FormField>,
    finished: bool,
}

pub struct FlowManager {
    entries: Arc<ConfigEntries>,
    handlers: DashMap<String, FlowFactory>,
    /// Active flows: flow_id -> flow state
    flows: RwLock<HashMap<String, Arc<Mutex<ActiveFlow>>>>,
    claims: Arc<UniqueIdClaims>,
}

impl FlowManager {
    pub fn new(entries: Arc<ConfigEntries>) -> Self {
        Self {
            entries,
            handlers: DashMap::new(),
            flows: RwLock::new(HashMap::new()),
            claims: Arc::new(UniqueIdClaims::new()),
        }
    }

    /// Register the flow factory for a domain
    pub fn register_handler(&self, domain: &str, factory: FlowFactory) {
        self.handlers.insert(domain.to_string(), factory);
        debug!("Registered config flow handler for domain: {}", domain);
    }

    pub fn has_handler(&self, domain: &str) -> bool {
        self.handlers.contains_key(domain)
    }

    /// Start a new flow and run its `user` step with no input
    pub async fn start_flow(
        &self,
        handler: &str,
        source: ConfigEntrySource,
    ) -> FlowManagerResult<FlowResult> {
        let factory = self
            .handlers
            .get(handler)
            .map(|f| f.value().clone())
            .ok_or_else(|| FlowManagerError::UnknownHandler(handler.to_string()))?;

        let flow_id = Ulid::new().to_string().to_lowercase();
        info!("Starting config flow for {} with flow_id {}", handler, flow_id);

        let ctx = FlowContext::new(
            flow_id.clone(),
            handler,
            source,
            self.entries.clone(),
            self.claims.clone(),
        );
        let mut active = ActiveFlow {
            flow: factory(),
            ctx,
            current_step: "user".to_string(),
            data_schema: Vec::new(),
            finished: false,
        };

        let result = self.run_step(&mut active, None).await?;
        if !active.finished {
            let mut flows = self.flows.write().await;
            flows.insert(flow_id, Arc::new(Mutex::new(active)));
        }

        Ok(result)
    }

    /// Continue a flow with user input for its current step
    pub async fn progress_flow(
        &self,
        flow_id: &str,
        user_input: Option<FlowInput>,
    ) -> FlowManagerResult<FlowResult> {
        let flow = self.get_flow(flow_id).await?;
        let mut active = flow.lock().await;
        if active.finished {
            return Err(FlowManagerError::UnknownFlow(flow_id.to_string()));
        }

        info!(
            "Progressing flow {} for {} at step {}",
            flow_id, active.ctx.handler, active.current_step
        );

        let user_input = match user_input {
            Some(input) => Some(validate_input(&active.data_schema, &input)?),
            None => None,
        };

        let result = self.run_step(&mut active, user_input).await?;
        if active.finished {
            self.flows.write().await.remove(flow_id);
        }

        Ok(result)
    }

    /// Abort a running flow
    pub async fn abort_flow(&self, flow_id: &str) -> FlowManagerResult<()> {
        let flow = self
            .flows
            .write()
            .await
            .remove(flow_id)
            .ok_or_else(|| FlowManagerError::UnknownFlow(flow_id.to_string()))?;

        let mut active = flow.lock().await;
        active.finished = true;
        self.claims.release_flow(flow_id);
        info!("Aborted flow {} for {}", flow_id, active.ctx.handler);
        Ok(())
    }

    /// Describe the flows in progress
    pub async fn list_flows(&self) -> Vec<serde_json::Value> {
        let flows: Vec<_> = self.flows.read().await.values().cloned().collect();

        let mut listed = Vec::with_capacity(flows.len());
        for flow in flows {
            let active = flow.lock().await;
            listed.push(serde_json::json!({
                "flow_id": active.ctx.flow_id,
                "handler": active.ctx.handler,
                "step_id": active.current_step,
                "context": {
                    "source": active.ctx.source.as_str(),
                    "unique_id": active.ctx.unique_id(),
                }
            }));
        }
        listed
    }

    async fn get_flow(&self, flow_id: &str) -> FlowManagerResult<Arc<Mutex<ActiveFlow>>> {
        self.flows
            .read()
            .await
            .get(flow_id)
            .cloned()
            .ok_or_else(|| FlowManagerError::UnknownFlow(flow_id.to_string()))
    }

    /// Run the current step and turn its outcome into a result
    async fn run_step(
        &self,
        active: &mut ActiveFlow,
        user_input: Option<FlowInput>,
    ) -> FlowManagerResult<FlowResult> {
        let step_id = active.current_step.clone();
        debug!("Calling step {} on flow {}", step_id, active.ctx.flow_id);

        let step = match active
            .flow
            .async_step(&mut active.ctx, &step_id, user_input)
            .await
        {
            Ok(step) => step,
            Err(FlowError::Abort(reason)) => FlowStep::Abort { reason },
            Err(err) => return Err(err.into()),
        };

        let flow_id = active.ctx.flow_id.clone();
        let handler = active.ctx.handler.clone();

        let result = match step {
            FlowStep::Form {
                step_id,
                data_schema,
                errors,
                description_placeholders,
                last_step,
            } => {
                active.current_step = step_id.clone();
                active.data_schema = data_schema.clone();
                FlowResult {
                    step_id: Some(step_id),
                    data_schema,
                    errors: non_empty(errors),
                    description_placeholders: non_empty(description_placeholders),
                    last_step,
                    ..FlowResult::base(&flow_id, &handler, FlowResultType::Form)
                }
            }
            FlowStep::CreateEntry { title, data } => {
                let version = (active.flow.version(), active.flow.minor_version());
                self.create_entry(&active.ctx, version, title, data).await?
            }
            FlowStep::Abort { reason } => FlowResult::abort(&flow_id, &handler, reason),
        };

        if result.is_finished() {
            active.finished = true;
            self.claims.release_flow(&flow_id);
            info!(
                "Flow {} completed with result type: {:?}",
                flow_id, result.result_type
            );
        }

        Ok(result)
    }

    async fn create_entry(
        &self,
        ctx: &FlowContext,
        (version, minor_version): (u32, u32),
        title: String,
        data: HashMap<String, serde_json::Value>,
    ) -> FlowManagerResult<FlowResult> {
        let mut entry = ConfigEntry::new(ctx.handler.clone(), title.clone())
            .with_data(data.clone())
            .with_source(ctx.source)
            .with_version(version, minor_version);
        if let Some(unique_id) = ctx.unique_id() {
            entry = entry.with_unique_id(unique_id);
        }

        let entry = match self.entries.add(entry).await {
            Ok(entry) => entry,
            // Another flow finished first with the same unique id
            Err(ConfigEntriesError::AlreadyExists { .. }) => {
                return Ok(FlowResult::abort(
                    &ctx.flow_id,
                    &ctx.handler,
                    ABORT_ALREADY_CONFIGURED.to_string(),
                ))
            }
            Err(err) => return Err(err.into()),
        };

        Ok(FlowResult {
            title: Some(title),
            version: Some(version),
            minor_version: Some(minor_version),
            result: Some(serde_json::json!({
                "entry_id": entry.entry_id,
                "domain": entry.domain,
                "title": entry.title,
                "unique_id": entry.unique_id,
                "data": data,
            })),
            ..FlowResult::base(&ctx.flow_id, &ctx.handler, FlowResultType::CreateEntry)
        })
    }
}
