use crate::client::ClientConfig;
use crate::domain::ClientError;
use reqwest::header::{
    ACCEPT, AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE, HeaderMap, HeaderValue, IF_NONE_MATCH,
    USER_AGENT,
};
use reqwest::{Client, ClientBuilder, RequestBuilder};
use url::Url;

pub const INTAKE_PATH: &str = "intake/v2/events";
pub const CONFIG_PATH: &str = "config/v1/agents";

/// The connection pool plus everything needed to address the APM Server.
///
/// One instance per client; the intake worker and the config poller share it.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    intake_url: Url,
    config_url: Url,
    authorization: Option<HeaderValue>,
    user_agent: String,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, ClientError> {
        let base = config.base_url()?;
        let intake_url = endpoint(&base, INTAKE_PATH);
        let config_url = endpoint(&base, CONFIG_PATH);

        let user_agent = compose_user_agent(config.user_agent.as_deref());
        let authorization = authorization_header(config)?;

        // Pool lifetime is tied to this transport; nothing is shared process-wide.
        let client = ClientBuilder::new()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.max_sockets)
            .pool_idle_timeout(config.keep_alive)
            .danger_accept_invalid_certs(!config.verify_server_cert)
            .gzip(true)
            .build()
            .map_err(|e| {
                ClientError::InvalidConfiguration(format!("Failed to build HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            intake_url,
            config_url,
            authorization,
            user_agent,
        })
    }

    pub fn intake_url(&self) -> &Url {
        &self.intake_url
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// A POST to the intake endpoint with the streaming-body headers set.
    pub fn intake_request(&self) -> RequestBuilder {
        let mut headers = self.common_headers();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/x-ndjson"));
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));

        self.client.post(self.intake_url.clone()).headers(headers)
    }

    /// A conditional GET for the agent configuration of one service.
    pub fn config_request(
        &self,
        service_name: &str,
        environment: Option<&str>,
        etag: Option<&str>,
    ) -> RequestBuilder {
        let mut url = self.config_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("service.name", service_name);
            if let Some(environment) = environment {
                query.append_pair("service.environment", environment);
            }
        }

        let mut headers = self.common_headers();
        if let Some(value) = etag.and_then(|etag| HeaderValue::from_str(etag).ok()) {
            headers.insert(IF_NONE_MATCH, value);
        }

        self.client.get(url).headers(headers)
    }

    fn common_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Ok(value) = HeaderValue::from_str(&self.user_agent) {
            headers.insert(USER_AGENT, value);
        }
        if let Some(auth) = &self.authorization {
            headers.insert(AUTHORIZATION, auth.clone());
        }
        headers
    }
}

/// Appends `suffix` to the base URL path, keeping any path prefix.
fn endpoint(base: &Url, suffix: &str) -> Url {
    let mut url = base.clone();
    let path = format!("{}/{}", base.path().trim_end_matches('/'), suffix);
    url.set_path(&path);
    url.set_query(None);
    url
}

/// `<app> rask-apm-client/<version> rust/<rustc version>`, app part optional.
pub fn compose_user_agent(app_user_agent: Option<&str>) -> String {
    let client_part = format!(
        "rask-apm-client/{} rust/{}",
        crate::VERSION,
        env!("RASK_APM_RUSTC_VERSION")
    );
    match app_user_agent.map(str::trim).filter(|ua| !ua.is_empty()) {
        Some(app) => format!("{app} {client_part}"),
        None => client_part,
    }
}

fn authorization_header(config: &ClientConfig) -> Result<Option<HeaderValue>, ClientError> {
    let raw = match (&config.api_key, &config.secret_token) {
        (Some(key), _) => format!("ApiKey {key}"),
        (None, Some(token)) => format!("Bearer {token}"),
        (None, None) => return Ok(None),
    };

    let mut value = HeaderValue::from_str(&raw).map_err(|_| {
        ClientError::InvalidConfiguration("Credentials contain invalid header characters".into())
    })?;
    value.set_sensitive(true);
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ClientConfig {
        ClientConfig::new("http://apm.internal:8200/proxy/", "checkout")
    }

    #[test]
    fn test_endpoints_keep_base_path() {
        let transport = HttpTransport::new(&config()).unwrap();
        assert_eq!(
            transport.intake_url().as_str(),
            "http://apm.internal:8200/proxy/intake/v2/events"
        );

        let request = transport
            .config_request("checkout", Some("prod"), None)
            .build()
            .unwrap();
        assert_eq!(
            request.url().as_str(),
            "http://apm.internal:8200/proxy/config/v1/agents?service.name=checkout&service.environment=prod"
        );
        assert!(request.headers().get(IF_NONE_MATCH).is_none());
    }

    #[test]
    fn test_intake_headers() {
        let mut config = config();
        config.secret_token = Some("s3cr3t".into());
        config.user_agent = Some("my-service/2.1".into());

        let transport = HttpTransport::new(&config).unwrap();
        let request = transport.intake_request().build().unwrap();
        let headers = request.headers();

        assert_eq!(headers[CONTENT_TYPE], "application/x-ndjson");
        assert_eq!(headers[CONTENT_ENCODING], "gzip");
        assert_eq!(headers[ACCEPT], "application/json");
        assert_eq!(headers[AUTHORIZATION], "Bearer s3cr3t");
        let ua = headers[USER_AGENT].to_str().unwrap();
        assert!(ua.starts_with("my-service/2.1 rask-apm-client/"));
        assert!(ua.contains(" rust/"));
    }

    #[test]
    fn test_api_key_wins_over_secret_token() {
        let mut config = config();
        config.secret_token = Some("token".into());
        config.api_key = Some("key".into());

        let transport = HttpTransport::new(&config).unwrap();
        let request = transport
            .config_request("checkout", None, Some("\"42\""))
            .build()
            .unwrap();

        assert_eq!(request.headers()[AUTHORIZATION], "ApiKey key");
        assert_eq!(request.headers()[IF_NONE_MATCH], "\"42\"");
        assert_eq!(
            request.url().query(),
            Some("service.name=checkout")
        );
    }

    #[test]
    fn test_user_agent_without_app_part() {
        let ua = compose_user_agent(Some("   "));
        assert!(ua.starts_with("rask-apm-client/"));
    }
}
