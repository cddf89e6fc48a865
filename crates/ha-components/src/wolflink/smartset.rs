//! HTTP client for the Wolf SmartSet cloud portal

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use super::client::{Device, WolfClient, WolfClientError, WolfClientResult};

const CLIENT_ID: &str = "smartset.web";
const TOKEN_SCOPE: &str = "openid api role";

fn default_base_url() -> String {
    "https://www.wolf-smartset.com/portal".to_string()
}

fn default_localization_url() -> String {
    "https://www.wolf-smartset.com/js/localized-text".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

/// Connection settings for the SmartSet portal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmartSetConfig {
    /// Portal root, without trailing slash
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Folder serving `text.culture.<locale>.js`
    #[serde(default = "default_localization_url")]
    pub localization_url: String,

    /// Per-request timeout in milliseconds, must be non-zero
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for SmartSetConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            localization_url: default_localization_url(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl SmartSetConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_localization_url(mut self, url: impl Into<String>) -> Self {
        self.localization_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Build the shared HTTP client used by every session
    pub fn build_http_client(&self) -> WolfClientResult<Client> {
        if self.timeout_ms == 0 {
            return Err(WolfClientError::Unexpected(
                "SmartSet timeout must be non-zero".to_string(),
            ));
        }

        Client::builder()
            .timeout(Duration::from_millis(self.timeout_ms))
            .build()
            .map_err(|e| WolfClientError::Unexpected(format!("failed to create HTTP client: {}", e)))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Entry of `GetSystemList`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SystemDescription {
    id: i64,
    gateway_id: serde_json::Value,
    name: String,
}

impl From<SystemDescription> for Device {
    fn from(system: SystemDescription) -> Self {
        let gateway = match system.gateway_id {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        Device::new(system.name, system.id, gateway)
    }
}

fn transport_error(err: reqwest::Error) -> WolfClientError {
    if err.is_connect() || err.is_timeout() {
        WolfClientError::CannotConnect(err.to_string())
    } else {
        WolfClientError::Unexpected(err.to_string())
    }
}

fn check_status(response: Response) -> WolfClientResult<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else if status.is_server_error() {
        Err(WolfClientError::CannotConnect(format!(
            "{} returned {}",
            response.url(),
            status
        )))
    } else {
        Err(WolfClientError::Unexpected(format!(
            "{} returned {}",
            response.url(),
            status
        )))
    }
}

/// Locales are path segments like `en` or `de-AT`
fn is_valid_locale(locale: &str) -> bool {
    !locale.is_empty() && locale.chars().all(|c| c.is_ascii_alphabetic() || c == '-')
}

/// Extract the object literal from a `text.culture.<locale>.js` file.
///
/// The file assigns a single JSON object to a variable; only string values
/// are kept.
pub fn parse_localized_text(body: &str) -> WolfClientResult<HashMap<String, String>> {
    let (start, end) = match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if start < end => (start, end),
        _ => {
            return Err(WolfClientError::Unexpected(
                "localized text has no object literal".to_string(),
            ))
        }
    };

    let raw: HashMap<String, serde_json::Value> = serde_json::from_str(&body[start..=end])
        .map_err(|e| WolfClientError::Unexpected(format!("invalid localized text: {}", e)))?;

    Ok(raw
        .into_iter()
        .filter_map(|(key, value)| match value {
            serde_json::Value::String(text) => Some((key, text)),
            _ => None,
        })
        .collect())
}

/// One authenticated account session on the portal
pub struct SmartSetClient {
    http: Client,
    config: Arc<SmartSetConfig>,
    username: String,
    password: String,
    token: RwLock<Option<String>>,
    texts: RwLock<HashMap<String, String>>,
}

impl SmartSetClient {
    pub fn new(
        http: Client,
        config: Arc<SmartSetConfig>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            http,
            config,
            username: username.into(),
            password: password.into(),
            token: RwLock::new(None),
            texts: RwLock::new(HashMap::new()),
        }
    }

    /// Look up a loaded portal text
    pub async fn localized_text(&self, key: &str) -> Option<String> {
        self.texts.read().await.get(key).cloned()
    }

    /// Return the cached access token, requesting one if needed
    async fn access_token(&self) -> WolfClientResult<String> {
        if let Some(token) = self.token.read().await.clone() {
            return Ok(token);
        }

        let url = format!("{}/connect/token", self.config.base_url);
        debug!("Requesting SmartSet access token");

        let response = self
            .http
            .post(&url)
            .form(&[
                ("grant_type", "password"),
                ("username", self.username.as_str()),
                ("password", self.password.as_str()),
                ("client_id", CLIENT_ID),
                ("scope", TOKEN_SCOPE),
            ])
            .send()
            .await
            .map_err(transport_error)?;

        if matches!(
            response.status(),
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED
        ) {
            return Err(WolfClientError::InvalidAuth);
        }

        let token: TokenResponse = check_status(response)?
            .json()
            .await
            .map_err(transport_error)?;

        *self.token.write().await = Some(token.access_token.clone());
        Ok(token.access_token)
    }
}

#[async_trait]
impl WolfClient for SmartSetClient {
    async fn load_localized_json(&self, locale: &str) -> WolfClientResult<()> {
        if !is_valid_locale(locale) {
            return Err(WolfClientError::Unexpected(format!(
                "invalid locale: {:?}",
                locale
            )));
        }

        let url = format!("{}/text.culture.{}.js", self.config.localization_url, locale);
        debug!("Loading SmartSet texts for locale {}", locale);

        let response = self.http.get(&url).send().await.map_err(transport_error)?;
        let body = check_status(response)?
            .text()
            .await
            .map_err(transport_error)?;

        let texts = parse_localized_text(&body)?;
        debug!("Loaded {} SmartSet texts", texts.len());
        *self.texts.write().await = texts;
        Ok(())
    }

    async fn fetch_system_list(&self) -> WolfClientResult<Vec<Device>> {
        let token = self.access_token().await?;
        let url = format!("{}/api/portal/GetSystemList", self.config.base_url);

        let response = self
            .http
            .get(&url)
            .bearer_auth(&token)
            .send()
            .await
            .map_err(transport_error)?;

        if response.status() == StatusCode::UNAUTHORIZED {
            *self.token.write().await = None;
            return Err(WolfClientError::InvalidAuth);
        }

        let systems: Vec<SystemDescription> = check_status(response)?
            .json()
            .await
            .map_err(transport_error)?;

        debug!("SmartSet account has {} systems", systems.len());
        Ok(systems.into_iter().map(Device::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client_for(server: &mockito::ServerGuard) -> SmartSetClient {
        let config = SmartSetConfig::default()
            .with_base_url(server.url())
            .with_localization_url(format!("{}/js", server.url()));
        let http = config.build_http_client().unwrap();
        SmartSetClient::new(http, Arc::new(config), "user", "secret")
    }

    async fn mock_token(server: &mut mockito::ServerGuard, status: usize) -> mockito::Mock {
        server
            .mock("POST", "/connect/token")
            .with_status(status)
            .with_header("content-type", "application/json")
            .with_body(json!({"access_token": "abc", "expires_in": 3600}).to_string())
            .create_async()
            .await
    }

    #[test]
    fn test_config_defaults() {
        let config: SmartSetConfig = serde_json::from_value(json!({"timeout_ms": 5000})).unwrap();
        assert_eq!(config.base_url, "https://www.wolf-smartset.com/portal");
        assert_eq!(config.timeout_ms, 5000);
        assert_eq!(SmartSetConfig::default().timeout_ms, 30_000);
        assert_eq!(
            SmartSetConfig::default().with_base_url("http://host/portal/").base_url,
            "http://host/portal"
        );
    }

    #[test]
    fn test_timeout_keeps_milliseconds() {
        let config = SmartSetConfig::default().with_timeout(Duration::from_millis(1500));
        assert_eq!(config.timeout_ms, 1500);
        assert!(config.build_http_client().is_ok());

        let config = SmartSetConfig::default().with_timeout(Duration::from_millis(500));
        assert_eq!(config.timeout_ms, 500);

        let zero = SmartSetConfig::default().with_timeout(Duration::ZERO);
        assert!(matches!(
            zero.build_http_client(),
            Err(WolfClientError::Unexpected(_))
        ));
    }

    #[test]
    fn test_parse_localized_text() {
        let texts =
            parse_localized_text(r#"var culture_text = {"Heizung": "Heating", "Count": 3};"#)
                .unwrap();
        assert_eq!(texts.get("Heizung").map(String::as_str), Some("Heating"));
        assert!(!texts.contains_key("Count"));

        assert!(matches!(
            parse_localized_text("not javascript"),
            Err(WolfClientError::Unexpected(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_system_list() {
        let mut server = mockito::Server::new_async().await;
        let token = mock_token(&mut server, 200).await;
        let systems = server
            .mock("GET", "/api/portal/GetSystemList")
            .match_header("authorization", "Bearer abc")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!([
                    {"Id": 42, "GatewayId": 1001, "Name": "Boiler1"},
                    {"Id": 43, "GatewayId": "GW2", "Name": "Boiler2"}
                ])
                .to_string(),
            )
            .create_async()
            .await;

        let client = client_for(&server);
        let devices = client.fetch_system_list().await.unwrap();

        assert_eq!(
            devices,
            vec![
                Device::new("Boiler1", 42, "1001"),
                Device::new("Boiler2", 43, "GW2"),
            ]
        );
        token.assert_async().await;
        systems.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejected_credentials() {
        let mut server = mockito::Server::new_async().await;
        let _token = mock_token(&mut server, 400).await;

        let client = client_for(&server);
        let result = client.fetch_system_list().await;
        assert!(matches!(result, Err(WolfClientError::InvalidAuth)));
    }

    #[tokio::test]
    async fn test_server_error_is_connectivity() {
        let mut server = mockito::Server::new_async().await;
        let _token = mock_token(&mut server, 503).await;

        let client = client_for(&server);
        let result = client.fetch_system_list().await;
        assert!(matches!(result, Err(WolfClientError::CannotConnect(_))));
    }

    #[tokio::test]
    async fn test_unreachable_portal() {
        let config = SmartSetConfig::default().with_base_url("http://127.0.0.1:1");
        let http = config.build_http_client().unwrap();
        let client = SmartSetClient::new(http, Arc::new(config), "user", "secret");

        let result = client.fetch_system_list().await;
        assert!(matches!(result, Err(WolfClientError::CannotConnect(_))));
    }

    #[tokio::test]
    async fn test_malformed_system_list() {
        let mut server = mockito::Server::new_async().await;
        let _token = mock_token(&mut server, 200).await;
        let _systems = server
            .mock("GET", "/api/portal/GetSystemList")
            .with_status(200)
            .with_body("<html>maintenance</html>")
            .create_async()
            .await;

        let client = client_for(&server);
        let result = client.fetch_system_list().await;
        assert!(matches!(result, Err(WolfClientError::Unexpected(_))));
    }

    #[tokio::test]
    async fn test_load_localized_json() {
        let mut server = mockito::Server::new_async().await;
        let texts = server
            .mock("GET", "/js/text.culture.de.js")
            .with_status(200)
            .with_body(r#"var culture_text = {"Heating": "Heizung"};"#)
            .create_async()
            .await;
        let _missing = server
            .mock("GET", "/js/text.culture.xx.js")
            .with_status(404)
            .create_async()
            .await;

        let client = client_for(&server);
        client.load_localized_json("de").await.unwrap();
        assert_eq!(
            client.localized_text("Heating").await.as_deref(),
            Some("Heizung")
        );
        texts.assert_async().await;

        assert!(matches!(
            client.load_localized_json("xx").await,
            Err(WolfClientError::Unexpected(_))
        ));
    }

    #[tokio::test]
    async fn test_locale_cannot_leave_text_folder() {
        let mut server = mockito::Server::new_async().await;
        let any = server
            .mock("GET", mockito::Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let client = client_for(&server);
        for locale in ["../x", "a?b", "de/../../api", "", "de AT"] {
            assert!(
                matches!(
                    client.load_localized_json(locale).await,
                    Err(WolfClientError::Unexpected(_))
                ),
                "locale {:?} was accepted",
                locale
            );
        }
        any.assert_async().await;

        assert!(is_valid_locale("de-AT"));
    }
}
