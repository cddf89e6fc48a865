//! Wolf SmartSet Service (wolflink)
//!
//! Native config flow that connects a Wolf SmartSet account and registers
//! one heating system from it.

mod client;
mod config_flow;
pub mod consts;
mod smartset;

use std::sync::Arc;

use ha_config_entries::{ConfigFlow, FlowManager};
use tracing::info;

pub use client::{ClientFactory, Device, WolfClient, WolfClientError, WolfClientResult};
pub use config_flow::{user_schema, WolfLinkConfigFlow};
pub use smartset::{parse_localized_text, SmartSetClient, SmartSetConfig};

/// Register the wolflink config flow, backed by the SmartSet portal
pub fn register(flows: &FlowManager, config: SmartSetConfig) -> WolfClientResult<()> {
    let http = config.build_http_client()?;
    let config = Arc::new(config);

    let factory: ClientFactory = Arc::new(move |username: &str, password: &str| {
        Box::new(SmartSetClient::new(
            http.clone(),
            config.clone(),
            username,
            password,
        )) as Box<dyn WolfClient>
    });

    register_with_client(flows, factory);
    Ok(())
}

/// Register the wolflink config flow with a custom client factory
pub fn register_with_client(flows: &FlowManager, client_factory: ClientFactory) {
    flows.register_handler(
        consts::DOMAIN,
        Arc::new(move || {
            Box::new(WolfLinkConfigFlow::new(client_factory.clone())) as Box<dyn ConfigFlow>
        }),
    );
    info!("Registered {} config flow", consts::DOMAIN);
}
