//! Config Entries
//!
//! This crate provides the configuration entry system for Home Assistant
//! together with the native config flow framework that creates entries.
//!
//! # Key Types
//!
//! - [`ConfigEntry`] - A single integration configuration
//! - [`ConfigEntries`] - Store for all config entries
//! - [`ConfigFlow`] - A native multi-step setup wizard
//! - [`FlowManager`] - Drives flows and persists their results
//!
//! # Storage
//!
//! Config entries are persisted in `.storage/core.config_entries` with
//! version tracking for migrations.

pub mod entry;
pub mod flow;
pub mod flow_manager;
pub mod manager;
pub mod storage;

pub use entry::{ConfigEntry, ConfigEntrySource};

pub use flow::{
    validate_input, ConfigFlow, FlowContext, FlowError, FlowInput, FlowStep, FormField,
    SchemaError, UniqueIdClaims, UniqueIdLookup, ABORT_ALREADY_CONFIGURED,
    ABORT_ALREADY_IN_PROGRESS,
};

pub use flow_manager::{
    FlowFactory, FlowManager, FlowManagerError, FlowManagerResult, FlowResult, FlowResultType,
};

pub use manager::{
    ConfigEntries, ConfigEntriesData, ConfigEntriesError, ConfigEntriesResult, STORAGE_KEY,
    STORAGE_MINOR_VERSION, STORAGE_VERSION,
};

pub use storage::{Storable, Storage, StorageError, StorageFile, StorageResult};
