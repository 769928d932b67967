//! Registry entry construction.
//!
//! Turns a workload plus one target (address, port) into the entry that
//! gets registered with a Consul agent.  Everything here is pure: the
//! identity, tags and health check are derived only from the workload's
//! metadata, so building the same target twice always yields the same
//! entry.
//!
//! Health checks are chosen by the first matching annotation:
//!
//! * `service.health.path`: HTTP check against the health host and port.
//! * `service.health.ttl`: TTL check.
//! * `service.health.tcp` (non-empty): TCP check against host and port.
//! * otherwise an HTTP check on `/`.

use log::{debug, error, info};

use crate::error::{Error, Result};
use crate::types::{CheckKind, HealthCheck, RegistryEntry, Workload};

pub const ENABLED: &str = "consul.register/enabled";
pub const SERVICE_NAME: &str = "consul.register/service.name";
pub const SERVICE_TAGS: &str = "consul.register/service.tags";
pub const HEALTH_INTERVAL: &str = "consul.register/service.health.interval";
pub const HEALTH_TIMEOUT: &str = "consul.register/service.health.timeout";
pub const HEALTH_PATH: &str = "consul.register/service.health.path";
pub const HEALTH_HOST: &str = "consul.register/service.health.host";
pub const HEALTH_PORT: &str = "consul.register/service.health.port";
pub const HEALTH_TTL: &str = "consul.register/service.health.ttl";
pub const HEALTH_TCP: &str = "consul.register/service.health.tcp";

const DEFAULT_INTERVAL: &str = "10s";
const DEFAULT_TIMEOUT: &str = "90s";

/// Deterministic entry identity for one workload target.
pub fn entry_id(workload: &Workload, address: &str, port: i32) -> String {
    format!("{}-{}-{}-{}", workload.name, workload.uid, address, port)
}

/// Whether the workload opted into registration.
pub fn is_register_enabled(workload: &Workload) -> bool {
    let Some(value) = workload.annotations.get(ENABLED) else {
        debug!(
            "Service {} in {} namespace will not be registered in Consul. Lack of annotation {}",
            workload.name, workload.namespace, ENABLED
        );
        return false;
    };

    match parse_bool(value) {
        Some(true) => true,
        Some(false) => {
            info!(
                "Service {} in {} namespace is disabled by annotation. Value: {}",
                workload.name, workload.namespace, value
            );
            false
        }
        None => {
            error!("Can't convert value of {} annotation: {:?}", ENABLED, value);
            false
        }
    }
}

/// Accepts the usual boolean spellings used in Kubernetes annotations.
fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

/// Builds registry entries stamped with the ownership tag.
#[derive(Debug, Clone)]
pub struct EntryBuilder {
    owner_tag: String,
}

impl EntryBuilder {
    pub fn new(owner_tag: impl Into<String>) -> Self {
        Self {
            owner_tag: owner_tag.into(),
        }
    }

    pub fn owner_tag(&self) -> &str {
        &self.owner_tag
    }

    /// Build the entry for `workload` reachable at `address:port`.
    ///
    /// Fails only on annotation values that cannot be interpreted.
    pub fn build(&self, workload: &Workload, address: &str, port: i32) -> Result<RegistryEntry> {
        let annotations = &workload.annotations;

        let name = annotations
            .get(SERVICE_NAME)
            .cloned()
            .unwrap_or_else(|| workload.name.clone());

        let mut tags = vec![self.owner_tag.clone(), format!("uid:{}", workload.uid)];
        if let Some(value) = annotations.get(SERVICE_TAGS) {
            tags.extend(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(String::from),
            );
        }
        tags.extend(labels_to_tags(workload));

        let check = health_check(workload, address, port)?;
        debug!("{} tags {:?} Consul check: {:?}", name, tags, check);

        Ok(RegistryEntry {
            id: entry_id(workload, address, port),
            name,
            address: address.to_string(),
            port,
            tags,
            check,
        })
    }
}

/// Labels become `key:value` tags; a label whose value is `tag` becomes the bare key.
fn labels_to_tags(workload: &Workload) -> impl Iterator<Item = String> + '_ {
    workload.labels.iter().map(|(key, value)| {
        if value == "tag" {
            key.clone()
        } else {
            format!("{key}:{value}")
        }
    })
}

fn health_check(workload: &Workload, address: &str, port: i32) -> Result<HealthCheck> {
    let annotations = &workload.annotations;

    let interval = seconds(annotations.get(HEALTH_INTERVAL), HEALTH_INTERVAL)?
        .unwrap_or_else(|| DEFAULT_INTERVAL.to_string());
    let timeout = seconds(annotations.get(HEALTH_TIMEOUT), HEALTH_TIMEOUT)?
        .unwrap_or_else(|| DEFAULT_TIMEOUT.to_string());

    let host = annotations
        .get(HEALTH_HOST)
        .map(String::as_str)
        .unwrap_or(address);

    let port = match annotations.get(HEALTH_PORT) {
        Some(value) => value
            .trim()
            .parse::<i32>()
            .map_err(|e| Error::annotation(HEALTH_PORT, value.as_str(), e))?,
        None => port,
    };

    let kind = if let Some(path) = annotations.get(HEALTH_PATH) {
        CheckKind::Http(format!("http://{host}:{port}{path}"))
    } else if let Some(ttl) = annotations.get(HEALTH_TTL) {
        CheckKind::Ttl(ttl.clone())
    } else if annotations.get(HEALTH_TCP).is_some_and(|v| !v.is_empty()) {
        CheckKind::Tcp(format!("{host}:{port}"))
    } else {
        CheckKind::Http(format!("http://{host}:{port}/"))
    };

    Ok(HealthCheck {
        kind,
        interval,
        timeout,
    })
}

/// Whole seconds from an annotation, rendered as a Consul duration.
fn seconds(value: Option<&String>, annotation: &'static str) -> Result<Option<String>> {
    value
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .map(|secs| format!("{secs}s"))
                .map_err(|e| Error::annotation(annotation, raw.as_str(), e))
        })
        .transpose()
}
