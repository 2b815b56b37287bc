use reqwest::{Client, Method, Response, StatusCode, Url};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::cache::{ClientCache, ClientCacheConfig, SetOptions, WrapOptions};
use crate::keys::{cache_key, collection_of};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server error: status {status} body {body}")]
    Server { status: StatusCode, body: String },
    #[error("failed to parse body: {0}")]
    Decode(#[from] serde_json::Error),
}

/// HTTP client for the content API that memoizes reads in a [`ClientCache`].
///
/// Successful mutations drop every cached read of the affected collection.
#[derive(Debug)]
pub struct ApiClient {
    http: Client,
    base: Url,
    token: Option<String>,
    cache: ClientCache,
}

impl ApiClient {
    pub fn new(site: &str, config: ClientCacheConfig) -> Result<Self, ClientError> {
        let base = Url::parse(site)?.join("/")?;
        let http = Client::builder().user_agent(Self::user_agent()).build()?;
        Ok(Self {
            http,
            base,
            token: None,
            cache: ClientCache::new(config),
        })
    }

    pub fn user_agent() -> &'static str {
        concat!("gazette-client/", env!("CARGO_PKG_VERSION"))
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn cache(&self) -> &ClientCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut ClientCache {
        &mut self.cache
    }

    /// GET `path`, served from the cache while the entry is fresh.
    pub async fn get<T>(&mut self, path: &str, params: &[(&str, &str)]) -> Result<T, ClientError>
    where
        T: Serialize + DeserializeOwned,
    {
        self.get_with(path, params, false).await
    }

    /// GET `path` from the network and replace the cached copy.
    pub async fn refresh<T>(
        &mut self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<T, ClientError>
    where
        T: Serialize + DeserializeOwned,
    {
        self.get_with(path, params, true).await
    }

    async fn get_with<T>(
        &mut self,
        path: &str,
        params: &[(&str, &str)],
        force_refresh: bool,
    ) -> Result<T, ClientError>
    where
        T: Serialize + DeserializeOwned,
    {
        let key = cache_key(path, params);
        let options = WrapOptions {
            force_refresh,
            set: SetOptions::tagged(collection_of(path)),
        };

        let Self {
            http,
            base,
            token,
            cache,
        } = self;
        let url = request_url(base, path, params)?;
        cache
            .wrap(
                &key,
                || async move {
                    let request = authorize(http.request(Method::GET, url), token.as_deref());
                    match request.send().await {
                        Ok(response) => decode(response).await,
                        Err(err) => Err(ClientError::from(err)),
                    }
                },
                options,
            )
            .await
    }

    pub async fn create(&mut self, path: &str, body: &Value) -> Result<Value, ClientError> {
        self.mutate(Method::POST, path, Some(body)).await
    }

    pub async fn replace(&mut self, path: &str, body: &Value) -> Result<Value, ClientError> {
        self.mutate(Method::PUT, path, Some(body)).await
    }

    pub async fn patch(&mut self, path: &str, body: &Value) -> Result<Value, ClientError> {
        self.mutate(Method::PATCH, path, Some(body)).await
    }

    pub async fn delete(&mut self, path: &str) -> Result<(), ClientError> {
        self.mutate(Method::DELETE, path, None).await.map(|_| ())
    }

    async fn mutate(
        &mut self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, ClientError> {
        let url = request_url(&self.base, path, &[])?;
        let mut request = authorize(self.http.request(method, url), self.token.as_deref());
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        let value = if response.status() == StatusCode::NO_CONTENT {
            Value::Null
        } else {
            decode(response).await?
        };

        self.invalidate(path);
        Ok(value)
    }

    fn invalidate(&mut self, path: &str) {
        let Some(collection) = collection_of(path) else {
            return;
        };
        let pattern = format!("^/api/{}(/|\\?|$)", regex::escape(collection));
        let removed = self.cache.delete_by_pattern(&pattern);
        debug!(
            target = "gazette_client::client",
            collection,
            removed,
            "invalidated cached reads"
        );
    }
}

fn request_url(base: &Url, path: &str, params: &[(&str, &str)]) -> Result<Url, ClientError> {
    let mut url = base.join(path.trim_start_matches('/'))?;
    if !params.is_empty() {
        url.set_query(None);
        url.query_pairs_mut().extend_pairs(params);
    }
    Ok(url)
}

fn authorize(request: reqwest::RequestBuilder, token: Option<&str>) -> reqwest::RequestBuilder {
    match token {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let status = response.status();
    let bytes = response.bytes().await?;
    if !status.is_success() {
        let body = String::from_utf8_lossy(&bytes).into_owned();
        return Err(ClientError::Server { status, body });
    }
    Ok(serde_json::from_slice(&bytes)?)
}
