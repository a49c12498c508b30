//! Forwarding client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
use url::Url;

use crate::config::{GatewayConfig, UpstreamConfig};
use crate::http::X_REQUEST_ID;
use crate::upstream::UpstreamError;

/// A configured upstream API.
#[derive(Debug)]
pub struct Upstream {
    pub name: String,
    base_url: Url,
    api_key: Option<(HeaderName, HeaderValue)>,
}

impl Upstream {
    pub fn from_config(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| UpstreamError::InvalidConfig(format!("{}: {}", config.name, e)))?;

        let api_key = match &config.api_key {
            Some(key) => {
                let name = HeaderName::from_bytes(config.api_key_header.as_bytes())
                    .map_err(|e| UpstreamError::InvalidConfig(format!("{}: {}", config.name, e)))?;
                let mut value = HeaderValue::from_str(key)
                    .map_err(|e| UpstreamError::InvalidConfig(format!("{}: {}", config.name, e)))?;
                value.set_sensitive(true);
                Some((name, value))
            }
            None => None,
        };

        Ok(Self {
            name: config.name.clone(),
            base_url,
            api_key,
        })
    }

    /// Join `path` onto the base URL path and attach `query`.
    pub fn target_url(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.base_url.clone();
        let base_path = url.path().trim_end_matches('/').to_string();
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            url.set_path(if base_path.is_empty() { "/" } else { &base_path });
        } else {
            url.set_path(&format!("{}/{}", base_path, path));
        }
        url.set_query(query);
        url
    }

    /// Add the upstream API key unless the client supplied its own.
    fn apply_api_key(&self, headers: &mut HeaderMap) {
        if let Some((name, value)) = &self.api_key {
            if !headers.contains_key(name) {
                headers.insert(name.clone(), value.clone());
            }
        }
    }
}

/// Pooled HTTP client plus the upstream table of one config snapshot.
#[derive(Debug)]
pub struct UpstreamClient {
    http: reqwest::Client,
    upstreams: HashMap<String, Arc<Upstream>>,
}

impl UpstreamClient {
    pub fn from_config(config: &GatewayConfig) -> Result<Self, UpstreamError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.timeouts.connect_secs))
            .timeout(Duration::from_secs(config.timeouts.request_secs))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| UpstreamError::InvalidConfig(e.to_string()))?;

        let mut upstreams = HashMap::new();
        for upstream in &config.upstreams {
            upstreams.insert(
                upstream.name.clone(),
                Arc::new(Upstream::from_config(upstream)?),
            );
        }

        Ok(Self { http, upstreams })
    }

    pub fn get(&self, name: &str) -> Result<&Arc<Upstream>, UpstreamError> {
        self.upstreams
            .get(name)
            .ok_or_else(|| UpstreamError::Unknown(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }

    /// Send one request upstream. `headers` must already be stripped of
    /// hop-by-hop fields.
    pub async fn forward(
        &self,
        upstream: &Upstream,
        method: Method,
        path: &str,
        query: Option<&str>,
        mut headers: HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response, UpstreamError> {
        let url = upstream.target_url(path, query);
        upstream.apply_api_key(&mut headers);

        tracing::debug!(
            upstream = %upstream.name,
            method = %method,
            url = %url,
            request_id = headers.get(X_REQUEST_ID).and_then(|v| v.to_str().ok()).unwrap_or("-"),
            "Forwarding request"
        );

        let response = self
            .http
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await?;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream(base: &str, key: Option<&str>) -> Upstream {
        Upstream::from_config(&UpstreamConfig {
            name: "db".into(),
            base_url: base.into(),
            api_key: key.map(Into::into),
            api_key_header: "apikey".into(),
        })
        .unwrap()
    }

    #[test]
    fn test_target_url() {
        let db = upstream("https://project.db.example.co/rest/v1/", None);
        assert_eq!(
            db.target_url("/trips", Some("select=*&id=eq.7")).as_str(),
            "https://project.db.example.co/rest/v1/trips?select=*&id=eq.7"
        );
        assert_eq!(
            db.target_url("/", None).as_str(),
            "https://project.db.example.co/rest/v1"
        );

        let bare = upstream("http://127.0.0.1:9000", None);
        assert_eq!(bare.target_url("/geocode", None).as_str(), "http://127.0.0.1:9000/geocode");
        assert_eq!(bare.target_url("/", None).as_str(), "http://127.0.0.1:9000/");
    }

    #[test]
    fn test_api_key_not_overridden() {
        let db = upstream("http://127.0.0.1:9000", Some("anon"));

        let mut headers = HeaderMap::new();
        db.apply_api_key(&mut headers);
        assert_eq!(headers["apikey"], "anon");

        let mut own = HeaderMap::new();
        own.insert("apikey", "service".parse().unwrap());
        db.apply_api_key(&mut own);
        assert_eq!(own["apikey"], "service");
    }

    #[test]
    fn test_invalid_header_name_rejected() {
        let err = Upstream::from_config(&UpstreamConfig {
            name: "tours".into(),
            base_url: "https://tours.example.com".into(),
            api_key: Some("k".into()),
            api_key_header: "bad header".into(),
        })
        .unwrap_err();
        assert!(matches!(err, UpstreamError::InvalidConfig(_)));
    }
}
