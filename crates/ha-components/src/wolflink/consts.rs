//! Constants for the Wolf SmartSet integration

pub const DOMAIN: &str = "wolflink";

pub const CONF_USERNAME: &str = "username";
pub const CONF_PASSWORD: &str = "password";

pub const DEVICE_NAME: &str = "device_name";
pub const DEVICE_GATEWAY: &str = "device_gateway";
pub const DEVICE_ID: &str = "device_id";
pub const LOCALE: &str = "locale";

pub const DEFAULT_LOCALE: &str = "en";

/// Entry version written by the config flow
pub const VERSION: u32 = 1;
pub const MINOR_VERSION: u32 = 2;

pub const STEP_USER: &str = "user";
pub const STEP_DEVICE: &str = "device";

// Form error codes
pub const ERROR_CANNOT_CONNECT: &str = "cannot_connect";
pub const ERROR_INVALID_AUTH: &str = "invalid_auth";
pub const ERROR_UNKNOWN: &str = "unknown";
/// The account was accepted but has no systems to pick from
pub const ERROR_NO_DEVICES: &str = "no_devices";
