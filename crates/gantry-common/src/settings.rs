//! Operator settings loaded from a typed ConfigMap
//!
//! Settings are read once at startup. Missing or unparseable values are
//! process-fatal there; runtime code only ever sees a validated value.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::ConfigMap;

use crate::crd::parse_duration;
use crate::{Error, Result};

/// Name of the ConfigMap holding operator settings
pub const SETTINGS_CONFIG_MAP: &str = "gantry-global-settings";

/// Validated operator settings
#[derive(Clone, Debug)]
pub struct Settings {
    /// Maximum window the batcher will extend a batch to
    pub batch_max_duration: Duration,
    /// Quiet period that closes a batch early
    pub batch_idle_duration: Duration,
    /// Age after which an unregistered cloud instance is garbage collected
    pub ttl_after_not_registered: Duration,
    /// Name of the cluster, passed to the cloud provider for tagging
    pub cluster_name: String,
    /// API endpoint of the cluster, passed to launched nodes
    pub cluster_endpoint: String,
    /// Whether drift detection marks claims for replacement
    pub drift_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            batch_max_duration: Duration::from_secs(10),
            batch_idle_duration: Duration::from_secs(1),
            ttl_after_not_registered: Duration::from_secs(15 * 60),
            cluster_name: String::new(),
            cluster_endpoint: String::new(),
            drift_enabled: true,
        }
    }
}

impl Settings {
    /// Parse settings from a ConfigMap's data map
    ///
    /// `clusterName` and `clusterEndpoint` are required; durations fall back
    /// to their defaults when absent but fail on unparseable values.
    pub fn from_data(data: &BTreeMap<String, String>) -> Result<Self> {
        let mut settings = Settings::default();

        settings.cluster_name = data
            .get("clusterName")
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| Error::validation_for(SETTINGS_CONFIG_MAP, "clusterName is required"))?;
        settings.cluster_endpoint = data
            .get("clusterEndpoint")
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| {
                Error::validation_for(SETTINGS_CONFIG_MAP, "clusterEndpoint is required")
            })?;

        for (key, target) in [
            ("batchMaxDuration", &mut settings.batch_max_duration),
            ("batchIdleDuration", &mut settings.batch_idle_duration),
            ("ttlAfterNotRegistered", &mut settings.ttl_after_not_registered),
        ] {
            if let Some(raw) = data.get(key) {
                *target = parse_duration(raw).map_err(|e| {
                    Error::validation_for(SETTINGS_CONFIG_MAP, format!("{key}: {e}"))
                })?;
            }
        }

        if let Some(raw) = data.get("featureGates.driftEnabled") {
            settings.drift_enabled = raw
                .parse()
                .map_err(|_| {
                    Error::validation_for(
                        SETTINGS_CONFIG_MAP,
                        format!("featureGates.driftEnabled: expected bool, got {raw:?}"),
                    )
                })?;
        }

        if settings.batch_idle_duration > settings.batch_max_duration {
            return Err(Error::validation_for(
                SETTINGS_CONFIG_MAP,
                "batchIdleDuration must not exceed batchMaxDuration",
            ));
        }
        Ok(settings)
    }

    /// Parse settings from the settings ConfigMap object
    pub fn from_config_map(cm: &ConfigMap) -> Result<Self> {
        static EMPTY: BTreeMap<String, String> = BTreeMap::new();
        Self::from_data(cm.data.as_ref().unwrap_or(&EMPTY))
    }
}
