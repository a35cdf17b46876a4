use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, LINK};
use reqwest::{Method, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::{GetOptions, RemoteClient, RemoteError};

const JSON_MEDIA_TYPE: &str = "application/vnd.github+json";
const RAW_MEDIA_TYPE: &str = "application/vnd.github.raw";

#[derive(Debug, Deserialize)]
struct GraphResponse {
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphError>,
}

#[derive(Debug, Deserialize)]
struct GraphError {
    message: String,
}

/// reqwest-backed [`RemoteClient`] talking to api.github.com or a GitHub
/// Enterprise `/api/v3/` endpoint.
pub struct HttpClient {
    http: reqwest::Client,
    endpoint: Url,
    graphql_url: Url,
    token: Option<String>,
    cache: Mutex<HashMap<String, Value>>,
}

impl HttpClient {
    pub fn new(endpoint: &str, token: Option<String>) -> Result<Self, RemoteError> {
        let normalized = if endpoint.ends_with('/') {
            endpoint.to_string()
        } else {
            format!("{endpoint}/")
        };
        let endpoint =
            Url::parse(&normalized).map_err(|_| RemoteError::InvalidUrl(normalized.clone()))?;
        let graphql_url = graphql_url_for(&endpoint)?;
        let http = reqwest::Client::builder().user_agent("depbot").build()?;

        Ok(Self {
            http,
            endpoint,
            graphql_url,
            token,
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn url(&self, path: &str) -> Result<Url, RemoteError> {
        self.endpoint
            .join(path.trim_start_matches('/'))
            .map_err(|_| RemoteError::InvalidUrl(path.to_string()))
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
        token: Option<&str>,
        headers: &[(String, String)],
    ) -> Result<reqwest::Response, RemoteError> {
        let mut request = self.http.request(method, url);
        if !headers.iter().any(|(name, _)| name.eq_ignore_ascii_case("accept")) {
            request = request.header(ACCEPT, JSON_MEDIA_TYPE);
        }
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(token) = token.or(self.token.as_deref()) {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
            .unwrap_or(text);
        Err(RemoteError::Status {
            status: status.as_u16(),
            message,
        })
    }

    async fn write(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> Result<Value, RemoteError> {
        let url = self.url(path)?;
        let response = self.send(method, url, body.as_ref(), token, &[]).await?;
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }
}

/// `https://api.github.com/` → `https://api.github.com/graphql`,
/// `https://ghe/api/v3/` → `https://ghe/api/graphql`.
fn graphql_url_for(endpoint: &Url) -> Result<Url, RemoteError> {
    let base = endpoint.as_str();
    let base = base.strip_suffix("v3/").unwrap_or(base);
    Url::parse(base)
        .and_then(|u| u.join("graphql"))
        .map_err(|_| RemoteError::InvalidUrl(base.to_string()))
}

/// Extract the `rel="next"` target from a `Link` header.
fn next_page(link_header: &str) -> Option<String> {
    link_header.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        if !params.split(';').any(|p| p.trim() == r#"rel="next""#) {
            return None;
        }
        let target = target.trim();
        target
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
            .map(str::to_string)
    })
}

#[async_trait]
impl RemoteClient for HttpClient {
    #[instrument(skip_all)]
    async fn query(&self, document: &str, variables: Value) -> Result<Value, RemoteError> {
        let body = serde_json::json!({ "query": document, "variables": variables });
        let response = self
            .send(Method::POST, self.graphql_url.clone(), Some(&body), None, &[])
            .await?;
        let parsed: GraphResponse = serde_json::from_str(&response.text().await?)?;

        let messages: Vec<&str> = parsed.errors.iter().map(|e| e.message.as_str()).collect();
        match parsed.data {
            Some(data) if !data.is_null() => {
                if !messages.is_empty() {
                    warn!(errors = ?messages, "GraphQL returned partial data");
                }
                Ok(data)
            }
            _ if !messages.is_empty() => Err(RemoteError::Graph(messages.join(", "))),
            _ => Err(RemoteError::Graph("No data in response".to_string())),
        }
    }

    #[instrument(skip(self, options), fields(paginate = options.paginate))]
    async fn get_json(&self, path: &str, options: GetOptions) -> Result<Value, RemoteError> {
        let url = self.url(path)?;
        // Responses differ per credential, so the token is part of the key.
        let cache_key = match options.token.as_deref() {
            Some(token) => format!("{url} {token}"),
            None => url.to_string(),
        };
        if !options.no_cache {
            if let Some(hit) = self.cache.lock().ok().and_then(|c| c.get(&cache_key).cloned()) {
                debug!("GET cache hit");
                return Ok(hit);
            }
        }

        let token = options.token.as_deref();
        let response = self
            .send(Method::GET, url, None, token, &options.headers)
            .await?;
        let mut link = response
            .headers()
            .get(LINK)
            .and_then(|v| v.to_str().ok())
            .and_then(next_page);
        let mut body: Value = serde_json::from_str(&response.text().await?)?;

        if options.paginate {
            if let Value::Array(items) = &mut body {
                while let Some(next) = link.take() {
                    let next_url =
                        Url::parse(&next).map_err(|_| RemoteError::InvalidUrl(next.clone()))?;
                    let page = self
                        .send(Method::GET, next_url, None, token, &options.headers)
                        .await?;
                    link = page
                        .headers()
                        .get(LINK)
                        .and_then(|v| v.to_str().ok())
                        .and_then(next_page);
                    if let Value::Array(more) = serde_json::from_str(&page.text().await?)? {
                        items.extend(more);
                    }
                }
            }
        }

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(cache_key, body.clone());
        }
        Ok(body)
    }

    async fn get_text(&self, path: &str, options: GetOptions) -> Result<String, RemoteError> {
        let url = self.url(path)?;
        let mut headers = options.headers;
        if !headers.iter().any(|(name, _)| name.eq_ignore_ascii_case("accept")) {
            headers.push(("Accept".to_string(), RAW_MEDIA_TYPE.to_string()));
        }
        let response = self
            .send(Method::GET, url, None, options.token.as_deref(), &headers)
            .await?;
        Ok(response.text().await?)
    }

    async fn post_json(
        &self,
        path: &str,
        body: Value,
        token: Option<&str>,
    ) -> Result<Value, RemoteError> {
        self.write(Method::POST, path, Some(body), token).await
    }

    async fn patch_json(
        &self,
        path: &str,
        body: Value,
        token: Option<&str>,
    ) -> Result<Value, RemoteError> {
        self.write(Method::PATCH, path, Some(body), token).await
    }

    async fn put_json(
        &self,
        path: &str,
        body: Value,
        token: Option<&str>,
    ) -> Result<Value, RemoteError> {
        self.write(Method::PUT, path, Some(body), token).await
    }

    async fn delete_json(&self, path: &str, token: Option<&str>) -> Result<(), RemoteError> {
        self.write(Method::DELETE, path, None, token).await?;
        Ok(())
    }
}
