//! Naming/config-service backend adapter (nacos-like discovery service with
//! its own instance model). Grounded in `grpc_service/nacos.go` and
//! `config/center/nacos.go` of the Go source, and in the teacher's
//! `reqwest`-based HTTP client style (`admin_api.rs`'s `GarageAdmin`).
//!
//! Unlike the Go source, which links the official `nacos-sdk-go` client
//! (push-based subscriptions over a long-lived gRPC/long-poll channel),
//! this adapter speaks the plain Nacos Open API over HTTP and polls for
//! changes. Functionally equivalent (full-list delivery on change) but
//! latency-bound by the poll interval rather than push latency — documented
//! as a deliberate simplification in DESIGN.md.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::warn;

use crate::backend::{Backend, KvEvent, LeaseHandle, LeaseId};
use crate::config::BackendConfig;
use crate::metadata::{Endpoint, ServiceMetadata};
use crate::{Error, Result};

const DEFAULT_GROUP: &str = "DEFAULT_GROUP";
const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct InstanceListResponse {
    #[serde(default)]
    hosts: Vec<Instance>,
}

#[derive(Debug, Deserialize)]
struct Instance {
    ip: String,
    port: u16,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default = "default_true")]
    healthy: bool,
}

fn default_true() -> bool {
    true
}

/// Adapter over the Nacos Open API (`/nacos/v1/ns/*`, `/nacos/v1/cs/*`).
pub struct NamingBackend {
    http: reqwest::Client,
    base_url: String,
    namespace: String,
    group: String,
}

impl NamingBackend {
    pub fn connect(config: &BackendConfig) -> Result<Self> {
        let endpoint = config
            .endpoint_list()
            .into_iter()
            .next()
            .ok_or_else(|| Error::Config("naming backend requires an endpoint".into()))?;
        let base_url = if endpoint.starts_with("http") {
            endpoint
        } else {
            format!("http://{endpoint}")
        };
        let http = reqwest::Client::builder()
            .connect_timeout(config.dial_timeout())
            .build()?;
        let group = if config.group().is_empty() {
            DEFAULT_GROUP.to_string()
        } else {
            config.group().to_string()
        };
        Ok(Self {
            http,
            base_url,
            namespace: config.namespace.clone(),
            group,
        })
    }

    fn instance_url(&self) -> String {
        format!("{}/nacos/v1/ns/instance", self.base_url)
    }

    fn instance_list_url(&self) -> String {
        format!("{}/nacos/v1/ns/instance/list", self.base_url)
    }

    fn config_url(&self) -> String {
        format!("{}/nacos/v1/cs/configs", self.base_url)
    }

    async fn fetch_instances(&self, service_name: &str) -> Result<Vec<Endpoint>> {
        let resp = self
            .http
            .get(self.instance_list_url())
            .query(&[
                ("serviceName", service_name),
                ("groupName", self.group.as_str()),
                ("namespaceId", self.namespace.as_str()),
                ("healthyOnly", "true"),
            ])
            .send()
            .await?
            .error_for_status()?;
        let body: InstanceListResponse = resp.json().await?;
        let mut addrs: Vec<Endpoint> = body
            .hosts
            .into_iter()
            .filter(|i| i.enabled && i.healthy)
            .filter_map(|i| Endpoint::parse(&format!("{}:{}", i.ip, i.port)).ok())
            .collect();
        addrs.sort();
        addrs.dedup();
        Ok(addrs)
    }
}

#[async_trait]
impl Backend for NamingBackend {
    async fn register_instance(&self, service: &ServiceMetadata, endpoint: &Endpoint) -> Result<()> {
        let resp = self
            .http
            .post(self.instance_url())
            .query(&[
                ("serviceName", service.unique_key()),
                ("groupName", self.group.as_str()),
                ("namespaceId", self.namespace.as_str()),
                ("ip", endpoint.host()),
                ("port", &endpoint.port().to_string()),
                ("weight", "10"),
                ("enable", "true"),
                ("healthy", "true"),
                ("ephemeral", "true"),
            ])
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() || body.trim() != "ok" {
            return Err(Error::PublishRejected(format!(
                "register service [{}] unsuccessful: {}",
                service.unique_key(),
                body
            )));
        }
        Ok(())
    }

    async fn deregister_instance(&self, service: &ServiceMetadata, endpoint: &Endpoint) -> Result<()> {
        let resp = self
            .http
            .delete(self.instance_url())
            .query(&[
                ("serviceName", service.unique_key()),
                ("groupName", self.group.as_str()),
                ("namespaceId", self.namespace.as_str()),
                ("ip", endpoint.host()),
                ("port", &endpoint.port().to_string()),
                ("ephemeral", "true"),
            ])
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() || body.trim() != "ok" {
            return Err(Error::PublishRejected(format!(
                "unregister service [{}] unsuccessful: {}",
                service.unique_key(),
                body
            )));
        }
        Ok(())
    }

    async fn resolve_once(&self, service: &ServiceMetadata) -> Result<Vec<Endpoint>> {
        self.fetch_instances(service.unique_key()).await
    }

    async fn subscribe(&self, service: &ServiceMetadata) -> Result<mpsc::Receiver<Vec<Endpoint>>> {
        let (tx, rx) = mpsc::channel(32);
        let http = self.http.clone();
        let base_url = self.base_url.clone();
        let namespace = self.namespace.clone();
        let group = self.group.clone();
        let service_name = service.unique_key().to_string();
        tokio::spawn(async move {
            let backend = NamingBackend {
                http,
                base_url,
                namespace,
                group,
            };
            let mut last: Option<Vec<Endpoint>> = None;
            loop {
                tokio::time::sleep(POLL_INTERVAL).await;
                match backend.fetch_instances(&service_name).await {
                    Ok(addrs) => {
                        if last.as_ref() != Some(&addrs) {
                            last = Some(addrs.clone());
                            if tx.send(addrs).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        warn!(component = "naming_backend", event = "poll_failed", error = %err);
                    }
                }
                if tx.is_closed() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let resp = self
            .http
            .get(self.config_url())
            .query(&[
                ("dataId", key),
                ("group", self.group.as_str()),
                ("tenant", self.namespace.as_str()),
            ])
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp.error_for_status()?;
        let text = resp.text().await?;
        if text.is_empty() {
            Ok(None)
        } else {
            Ok(Some(text))
        }
    }

    async fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        let resp = self
            .http
            .post(self.config_url())
            .query(&[
                ("dataId", key),
                ("group", self.group.as_str()),
                ("tenant", self.namespace.as_str()),
                ("content", value),
            ])
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() || body.trim() != "true" {
            return Err(Error::PublishRejected(format!("publish config [{key}] unsuccessful: {body}")));
        }
        Ok(())
    }

    async fn kv_set_with_lease(&self, key: &str, value: &str, _ttl_secs: i64) -> Result<LeaseId> {
        // The naming backend has no lease primitive; publish unconditionally
        // and hand back a synthetic id so callers can treat both backends
        // uniformly.
        self.kv_set(key, value).await?;
        Ok(LeaseId(0))
    }

    async fn kv_watch(&self, key: &str) -> Result<mpsc::Receiver<KvEvent>> {
        let (tx, rx) = mpsc::channel(32);
        let http = self.http.clone();
        let base_url = self.base_url.clone();
        let namespace = self.namespace.clone();
        let group = self.group.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let backend = NamingBackend {
                http,
                base_url,
                namespace,
                group,
            };
            let mut last: Option<String> = None;
            loop {
                tokio::time::sleep(POLL_INTERVAL).await;
                match backend.kv_get(&key).await {
                    Ok(Some(value)) if last.as_ref() != Some(&value) => {
                        last = Some(value.clone());
                        if tx
                            .send(KvEvent {
                                key: key.clone(),
                                value,
                            })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(component = "naming_backend", event = "config_poll_failed", error = %err);
                    }
                }
                if tx.is_closed() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn kv_watch_prefix(&self, _prefix: &str) -> Result<mpsc::Receiver<KvEvent>> {
        Err(Error::Config(
            "naming backend does not support prefix watches".into(),
        ))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.kv_get(key).await?.is_some())
    }

    async fn grant_lease(&self, _ttl_secs: i64) -> Result<LeaseHandle> {
        // No lease primitive: hand back a channel that ticks forever so a
        // Registrar built against this backend never perceives lease loss.
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(3)).await;
                if tx.send(()).await.is_err() {
                    break;
                }
            }
        });
        Ok(LeaseHandle {
            id: LeaseId(0),
            keepalive: rx,
        })
    }

    async fn put_with_lease(&self, key: &str, value: &str, _lease: LeaseId) -> Result<()> {
        self.kv_set(key, value).await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
