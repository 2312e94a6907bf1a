use anyhow::{anyhow, Result};
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_RANGE, CONTENT_TYPE},
    Client, Method, Response,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error};

use shared_config::AppConfig;

/// Thin PostgREST client for the Supabase project backing the queue.
pub struct SupabaseClient {
    client: Client,
    base_url: String,
    anon_key: String,
    service_key: String,
}

impl SupabaseClient {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            client: Client::new(),
            base_url: config.supabase_url.trim_end_matches('/').to_string(),
            anon_key: config.supabase_anon_key.clone(),
            service_key: config.supabase_service_role_key.clone(),
        }
    }

    fn get_headers(&self, prefer: Option<&str>) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        headers.insert("apikey", HeaderValue::from_str(&self.anon_key)?);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let bearer = if self.service_key.is_empty() {
            &self.anon_key
        } else {
            &self.service_key
        };
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", bearer))?);

        if let Some(prefer) = prefer {
            headers.insert("Prefer", HeaderValue::from_str(prefer)?);
        }

        Ok(headers)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        prefer: Option<&str>,
    ) -> Result<Response> {
        let url = format!("{}{}", self.base_url, path);
        debug!("Making {} request to {}", method, url);

        let mut req = self.client.request(method, &url).headers(self.get_headers(prefer)?);

        if let Some(body_data) = body {
            req = req.json(&body_data);
        }

        let response = req.send().await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await?;
            error!("API error ({}): {}", status, error_text);

            return Err(match status.as_u16() {
                401 | 403 => anyhow!("Authentication error: {}", error_text),
                404 => anyhow!("Resource not found: {}", error_text),
                _ => anyhow!("API error ({}): {}", status, error_text),
            });
        }

        Ok(response)
    }

    pub async fn request<T>(&self, method: Method, path: &str, body: Option<Value>) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let response = self.send(method, path, body, None).await?;
        let data = response.json::<T>().await?;
        Ok(data)
    }

    /// Run a write whose response body is not needed.
    pub async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        prefer: Option<&str>,
    ) -> Result<()> {
        self.send(method, path, body, prefer).await?;
        Ok(())
    }

    pub async fn select<T>(&self, table: &str, query: &str) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
    {
        let path = format!("/rest/v1/{}?{}", table, query);
        self.request(Method::GET, &path, None).await
    }

    /// Exact row count for a filter, read from the `Content-Range` total so
    /// the server's `max-rows` cap does not apply.
    pub async fn count(&self, table: &str, query: &str) -> Result<u64> {
        let path = format!("/rest/v1/{}?{}", table, query);
        let response = self.send(Method::HEAD, &path, None, Some("count=exact")).await?;

        let range = response
            .headers()
            .get(CONTENT_RANGE)
            .ok_or_else(|| anyhow!("Count response for {} has no Content-Range", table))?
            .to_str()?;
        parse_content_range_total(range)
    }

    /// Insert or merge rows keyed by `on_conflict`.
    pub async fn upsert(&self, table: &str, on_conflict: &str, body: Value) -> Result<()> {
        let path = format!("/rest/v1/{}?on_conflict={}", table, on_conflict);
        self.execute(
            Method::POST,
            &path,
            Some(body),
            Some("resolution=merge-duplicates,return=minimal"),
        )
        .await
    }
}

/// Total from a PostgREST `Content-Range` value such as `0-24/3573` or `*/0`.
fn parse_content_range_total(range: &str) -> Result<u64> {
    let total = range
        .rsplit_once('/')
        .map(|(_, total)| total)
        .ok_or_else(|| anyhow!("Malformed Content-Range: {}", range))?;
    total
        .parse()
        .map_err(|_| anyhow!("Content-Range total is not exact: {}", range))
}
