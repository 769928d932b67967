//! Consul agent client over the HTTP API.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};

use super::{Agent, AgentConnector};
use crate::config::ConsulConfig;
use crate::error::{Error, Result};
use crate::types::{CheckKind, RegisteredService, RegistryEntry};

const TOKEN_HEADER: &str = "X-Consul-Token";

/// Creates [`HttpAgent`]s that share one connection pool.
#[derive(Clone)]
pub struct HttpConnector {
    client: Client,
    scheme: String,
    port: u16,
    token: Option<String>,
}

impl HttpConnector {
    pub fn new(config: &ConsulConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            client,
            scheme: config.scheme.clone(),
            port: config.port,
            token: config.token.clone(),
        })
    }
}

impl AgentConnector for HttpConnector {
    fn connect(&self, host: &str) -> Arc<dyn Agent> {
        Arc::new(HttpAgent {
            client: self.client.clone(),
            base_url: format!("{}://{}:{}", self.scheme, host, self.port),
            token: self.token.clone(),
        })
    }
}

/// One Consul agent reached over HTTP.
pub struct HttpAgent {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpAgent {
    pub fn new(client: Client, base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.header(TOKEN_HEADER, token),
            None => request,
        }
    }

    async fn checked(&self, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::Consul {
            address: self.base_url.clone(),
            status: status.as_u16(),
            body: body.trim().to_string(),
        })
    }
}

#[async_trait]
impl Agent for HttpAgent {
    fn address(&self) -> &str {
        &self.base_url
    }

    async fn register(&self, entry: &RegistryEntry) -> Result<()> {
        let url = format!("{}/v1/agent/service/register", self.base_url);
        debug!("PUT {} {}", url, entry.id);
        let response = self
            .authorized(self.client.put(url))
            .json(&ServiceRegistration::from(entry))
            .send()
            .await?;
        self.checked(response).await?;
        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<()> {
        let url = format!("{}/v1/agent/service/deregister/{}", self.base_url, id);
        debug!("PUT {}", url);
        let response = self.authorized(self.client.put(url)).send().await?;
        self.checked(response).await?;
        Ok(())
    }

    async fn services(&self) -> Result<Vec<RegisteredService>> {
        let url = format!("{}/v1/agent/services", self.base_url);
        let response = self.authorized(self.client.get(url)).send().await?;
        let services: HashMap<String, AgentService> =
            self.checked(response).await?.json().await?;
        Ok(services
            .into_iter()
            .map(|(key, svc)| RegisteredService {
                id: if svc.id.is_empty() { key } else { svc.id },
                name: svc.service,
                address: svc.address,
                port: svc.port,
                tags: svc.tags.unwrap_or_default(),
            })
            .collect())
    }
}

/// Body of `/v1/agent/service/register`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceRegistration<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    tags: &'a [String],
    address: &'a str,
    port: i32,
    check: ServiceCheck<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceCheck<'a> {
    #[serde(rename = "HTTP", skip_serializing_if = "Option::is_none")]
    http: Option<&'a str>,
    #[serde(rename = "TCP", skip_serializing_if = "Option::is_none")]
    tcp: Option<&'a str>,
    #[serde(rename = "TTL", skip_serializing_if = "Option::is_none")]
    ttl: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    interval: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<&'a str>,
}

impl<'a> From<&'a RegistryEntry> for ServiceRegistration<'a> {
    fn from(entry: &'a RegistryEntry) -> Self {
        let check = &entry.check;
        let interval = Some(check.interval.as_str());
        let timeout = Some(check.timeout.as_str());
        // Consul refuses TTL checks that also carry an interval.
        let check = match &check.kind {
            CheckKind::Http(url) => ServiceCheck {
                http: Some(url.as_str()),
                tcp: None,
                ttl: None,
                interval,
                timeout,
            },
            CheckKind::Tcp(addr) => ServiceCheck {
                http: None,
                tcp: Some(addr.as_str()),
                ttl: None,
                interval,
                timeout,
            },
            CheckKind::Ttl(ttl) => ServiceCheck {
                http: None,
                tcp: None,
                ttl: Some(ttl.as_str()),
                interval: None,
                timeout: None,
            },
        };
        Self {
            id: &entry.id,
            name: &entry.name,
            tags: &entry.tags,
            address: &entry.address,
            port: entry.port,
            check,
        }
    }
}

/// One value of the `/v1/agent/services` map.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AgentService {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(default)]
    service: String,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    address: String,
    #[serde(default)]
    port: i32,
}
