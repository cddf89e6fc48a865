//! Config flow for Wolf SmartSet Service
//!
//! ```text
//! user ──(credentials ok)──▶ device ──▶ create_entry
//!   ▲         │                 └──▶ abort (already_configured)
//!   └─(error)─┘
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use ha_config_entries::{ConfigFlow, FlowContext, FlowError, FlowInput, FlowStep, FormField};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::client::{ClientFactory, Device, WolfClientError};
use super::consts::{
    CONF_PASSWORD, CONF_USERNAME, DEFAULT_LOCALE, DEVICE_GATEWAY, DEVICE_ID, DEVICE_NAME,
    ERROR_CANNOT_CONNECT, ERROR_INVALID_AUTH, ERROR_NO_DEVICES, ERROR_UNKNOWN, LOCALE,
    MINOR_VERSION, STEP_DEVICE, STEP_USER, VERSION,
};

#[derive(Debug, Deserialize)]
struct UserInput {
    username: String,
    password: String,
    locale: String,
}

#[derive(Debug, Deserialize)]
struct DeviceInput {
    device_name: String,
}

fn parse_input<T: for<'de> Deserialize<'de>>(input: FlowInput) -> Result<T, FlowError> {
    serde_json::from_value(serde_json::Value::Object(input))
        .map_err(|e| FlowError::InvalidInput(e.to_string()))
}

/// Schema of the credentials form
pub fn user_schema() -> Vec<FormField> {
    vec![
        FormField::required_string(CONF_USERNAME),
        FormField::required_string(CONF_PASSWORD),
        FormField::required_string(LOCALE),
    ]
}

/// Handle a config flow for Wolf SmartSet Service.
pub struct WolfLinkConfigFlow {
    client_factory: ClientFactory,
    username: Option<String>,
    password: Option<String>,
    locale: String,
    /// Set only by a successful user step
    fetched_systems: Option<Vec<Device>>,
}

impl WolfLinkConfigFlow {
    pub fn new(client_factory: ClientFactory) -> Self {
        Self {
            client_factory,
            username: None,
            password: None,
            locale: DEFAULT_LOCALE.to_string(),
            fetched_systems: None,
        }
    }

    /// Devices cached by the last successful user step
    pub fn fetched_systems(&self) -> Option<&[Device]> {
        self.fetched_systems.as_deref()
    }

    /// Handle the initial step to get connection parameters.
    pub async fn async_step_user(
        &mut self,
        ctx: &mut FlowContext,
        user_input: Option<FlowInput>,
    ) -> Result<FlowStep, FlowError> {
        let mut errors = HashMap::new();

        if let Some(input) = user_input {
            let input: UserInput = parse_input(input)?;
            let client = (self.client_factory)(&input.username, &input.password);

            let fetched = match client.load_localized_json(&input.locale).await {
                Ok(()) => client.fetch_system_list().await,
                Err(err) => Err(err),
            };

            match fetched {
                Ok(systems) if systems.is_empty() => {
                    warn!("Wolf SmartSet account has no systems");
                    errors.insert("base".to_string(), ERROR_NO_DEVICES.to_string());
                }
                Ok(systems) => {
                    debug!("Account has {} Wolf SmartSet systems", systems.len());
                    self.username = Some(input.username);
                    self.password = Some(input.password);
                    self.locale = input.locale;
                    self.fetched_systems = Some(systems);
                    return self.async_step_device(ctx, None).await;
                }
                Err(WolfClientError::CannotConnect(reason)) => {
                    debug!("Cannot connect to Wolf SmartSet: {}", reason);
                    errors.insert("base".to_string(), ERROR_CANNOT_CONNECT.to_string());
                }
                Err(WolfClientError::InvalidAuth) => {
                    errors.insert("base".to_string(), ERROR_INVALID_AUTH.to_string());
                }
                Err(WolfClientError::Unexpected(reason)) => {
                    error!("Unexpected exception: {}", reason);
                    errors.insert("base".to_string(), ERROR_UNKNOWN.to_string());
                }
            }
        }

        Ok(FlowStep::form(STEP_USER, user_schema()).with_errors(errors))
    }

    /// Allow user to select device from devices connected to specified account.
    pub async fn async_step_device(
        &mut self,
        ctx: &mut FlowContext,
        user_input: Option<FlowInput>,
    ) -> Result<FlowStep, FlowError> {
        let systems = match self.fetched_systems.as_deref() {
            Some(systems) if !systems.is_empty() => systems,
            _ => {
                return Err(FlowError::InvalidInput(
                    "device step reached without a verified account and device list".into(),
                ))
            }
        };

        let Some(input) = user_input else {
            let names = systems.iter().map(|device| device.name.clone()).collect();
            return Ok(FlowStep::form(
                STEP_DEVICE,
                vec![FormField::required_select(DEVICE_NAME, names)],
            ));
        };

        let DeviceInput { device_name } = parse_input(input)?;

        let mut matching = systems.iter().filter(|device| device.name == device_name);
        let device = matching
            .next()
            .ok_or_else(|| FlowError::InvalidInput(format!("unknown device: {}", device_name)))?;
        if matching.next().is_some() {
            warn!(
                "Several Wolf SmartSet systems are named {}, using id {}",
                device_name, device.id
            );
        }

        ctx.set_unique_id(device.id.to_string())?;
        ctx.abort_if_unique_id_configured()?;

        let mut data = HashMap::new();
        data.insert(CONF_USERNAME.to_string(), json!(self.username));
        data.insert(CONF_PASSWORD.to_string(), json!(self.password));
        data.insert(DEVICE_NAME.to_string(), json!(device_name));
        data.insert(DEVICE_GATEWAY.to_string(), json!(device.gateway));
        data.insert(DEVICE_ID.to_string(), json!(device.id));
        data.insert(LOCALE.to_string(), json!(self.locale));

        info!("Creating Wolf SmartSet entry for system {}", device.id);
        Ok(FlowStep::create_entry(device_name, data))
    }
}

#[async_trait]
impl ConfigFlow for WolfLinkConfigFlow {
    fn version(&self) -> u32 {
        VERSION
    }

    fn minor_version(&self) -> u32 {
        MINOR_VERSION
    }

    async fn async_step(
        &mut self,
        ctx: &mut FlowContext,
        step_id: &str,
        user_input: Option<FlowInput>,
    ) -> Result<FlowStep, FlowError> {
        match step_id {
            STEP_USER => self.async_step_user(ctx, user_input).await,
            STEP_DEVICE => self.async_step_device(ctx, user_input).await,
            other => Err(FlowError::UnknownStep(other.to_string())),
        }
    }
}
