//! Static configuration, runtime config management, and environment switches.
//!
//! [`MessengerConfig`] is an immutable snapshot: transports, routing tables,
//! retry policies and priority routing. [`RuntimeConfigManager`] owns the
//! live snapshot and swaps it atomically — readers always see a consistent
//! config, and an update whose result fails validation restores the previous
//! snapshot without firing listeners.

use std::collections::HashMap;
use std::env;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::MessengerError;
use crate::validate::{
    validate_priority, validate_queue_name, validate_transport_name, MAX_PRIORITY, MIN_PRIORITY,
};

/// Master switch environment variable.
pub const ENV_ENABLED: &str = "SYMPHONY_ENABLED";
/// Rollout flag for the email queue feature.
pub const ENV_EMAIL_QUEUE: &str = "SYMPHONY_EMAIL_QUEUE_ENABLED";
/// Rollout flag for campaign processing.
pub const ENV_CAMPAIGN_PROCESSING: &str = "SYMPHONY_CAMPAIGN_PROCESSING_ENABLED";
/// Rollout flag for SMS drip sending.
pub const ENV_SMS_DRIP: &str = "SYMPHONY_SMS_DRIP_ENABLED";

/// Kind of transport behind a configured name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// In-process, handler runs before `send` resolves.
    Sync,
    /// Database-backed, at-least-once delivery.
    #[default]
    Durable,
}

/// Per-transport configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// What backs this transport.
    #[serde(default)]
    pub kind: TransportKind,
    /// Default queue for envelopes routed here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    /// Default priority for envelopes routed here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    /// Lease TTL in milliseconds for durable transports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_duration_ms: Option<u64>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Durable,
            queue: None,
            priority: None,
            lock_duration_ms: None,
        }
    }
}

impl TransportConfig {
    /// A sync transport entry.
    pub fn sync() -> Self {
        Self {
            kind: TransportKind::Sync,
            ..Default::default()
        }
    }

    /// A durable transport entry.
    pub fn durable() -> Self {
        Self::default()
    }
}

/// Retry policy for a message type (or the `"default"` entry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retry budget.
    pub max_retries: u32,
    /// Base delay before the first retry, in milliseconds.
    pub delay_ms: u64,
    /// Exponential growth factor.
    pub multiplier: f64,
    /// Delay ceiling, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
        }
    }
}

/// Priority-band routing thresholds and targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityRouting {
    /// Priorities at or above this route to `high_transport`.
    pub high_threshold: u8,
    /// Priorities at or below this route to `low_transport`.
    pub low_threshold: u8,
    /// Target for the high band; falls back to the default transport.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_transport: Option<String>,
    /// Target for the low band; falls back to the default transport.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_transport: Option<String>,
    /// Target for everything in between; falls back to the default transport.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normal_transport: Option<String>,
}

impl Default for PriorityRouting {
    fn default() -> Self {
        Self {
            high_threshold: 8,
            low_threshold: 3,
            high_transport: None,
            low_transport: None,
            normal_transport: None,
        }
    }
}

/// Full messenger configuration snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessengerConfig {
    /// Transport used when routing resolves nothing more specific.
    pub default_transport: String,
    /// Queue used when neither options nor transport config name one.
    pub default_queue: String,
    /// Priority used when the caller does not set one.
    pub default_priority: u8,
    /// Named transports.
    pub transports: HashMap<String, TransportConfig>,
    /// Message-type routing: type → ordered transport candidates.
    #[serde(default)]
    pub routing: HashMap<String, Vec<String>>,
    /// Retry policies; must contain a `"default"` entry.
    pub retry: HashMap<String, RetryPolicy>,
    /// Optional priority-band routing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_routing: Option<PriorityRouting>,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        let mut transports = HashMap::new();
        transports.insert("sync".to_string(), TransportConfig::sync());

        let mut retry = HashMap::new();
        retry.insert("default".to_string(), RetryPolicy::default());

        Self {
            default_transport: "sync".to_string(),
            default_queue: "default".to_string(),
            default_priority: 5,
            transports,
            routing: HashMap::new(),
            retry,
            priority_routing: None,
        }
    }
}

impl MessengerConfig {
    /// Structural validation of the whole snapshot.
    pub fn validate(&self) -> Result<(), MessengerError> {
        validate_transport_name(&self.default_transport)
            .map_err(|e| MessengerError::Configuration(e.to_string()))?;
        validate_queue_name(&self.default_queue)
            .map_err(|e| MessengerError::Configuration(e.to_string()))?;
        validate_priority(self.default_priority)
            .map_err(|e| MessengerError::Configuration(e.to_string()))?;

        if !self.transports.contains_key(&self.default_transport) {
            return Err(MessengerError::Configuration(format!(
                "default transport {:?} is not configured",
                self.default_transport
            )));
        }
        if !self.retry.contains_key("default") {
            return Err(MessengerError::Configuration(
                "retry table must contain a \"default\" entry".to_string(),
            ));
        }

        for (name, transport) in &self.transports {
            validate_transport_name(name)
                .map_err(|e| MessengerError::Configuration(e.to_string()))?;
            if let Some(queue) = &transport.queue {
                validate_queue_name(queue)
                    .map_err(|e| MessengerError::Configuration(e.to_string()))?;
            }
            if let Some(priority) = transport.priority {
                validate_priority(priority)
                    .map_err(|e| MessengerError::Configuration(e.to_string()))?;
            }
        }

        for (message_type, targets) in &self.routing {
            if targets.is_empty() {
                return Err(MessengerError::Configuration(format!(
                    "routing entry for {message_type:?} is empty"
                )));
            }
            for target in targets {
                if !self.transports.contains_key(target) {
                    return Err(MessengerError::Configuration(format!(
                        "routing entry for {message_type:?} targets unknown transport {target:?}"
                    )));
                }
            }
        }

        for policy in self.retry.values() {
            if policy.multiplier < 1.0 {
                return Err(MessengerError::Configuration(
                    "retry multiplier must be >= 1".to_string(),
                ));
            }
        }

        if let Some(pr) = &self.priority_routing {
            for threshold in [pr.high_threshold, pr.low_threshold] {
                if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&threshold) {
                    return Err(MessengerError::Configuration(format!(
                        "priority routing threshold {threshold} out of range"
                    )));
                }
            }
            if pr.high_threshold <= pr.low_threshold {
                return Err(MessengerError::Configuration(
                    "priority routing high threshold must exceed low threshold".to_string(),
                ));
            }
            for target in [&pr.high_transport, &pr.low_transport, &pr.normal_transport]
                .into_iter()
                .flatten()
            {
                if !self.transports.contains_key(target) {
                    return Err(MessengerError::Configuration(format!(
                        "priority routing targets unknown transport {target:?}"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Retry policy for a message type, falling back to the default entry.
    pub fn retry_policy_for(&self, message_type: &str) -> RetryPolicy {
        self.retry
            .get(message_type)
            .or_else(|| self.retry.get("default"))
            .cloned()
            .unwrap_or_default()
    }
}

/// Callback invoked after a successful config swap.
pub type UpdateListener = Box<dyn Fn(&MessengerConfig) + Send + Sync>;

/// Owns the live config snapshot and serializes updates.
pub struct RuntimeConfigManager {
    current: RwLock<Arc<MessengerConfig>>,
    listeners: RwLock<Vec<UpdateListener>>,
}

impl RuntimeConfigManager {
    /// Validate and install an initial config.
    pub fn new(config: MessengerConfig) -> Result<Self, MessengerError> {
        config.validate()?;
        Ok(Self {
            current: RwLock::new(Arc::new(config)),
            listeners: RwLock::new(Vec::new()),
        })
    }

    /// The current snapshot. Cheap; clones an `Arc`.
    pub fn snapshot(&self) -> Arc<MessengerConfig> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Apply `mutate` to a copy of the current config, validate the result,
    /// and swap it in. On validation failure the live config is untouched and
    /// no listeners fire.
    pub fn update<F>(&self, mutate: F) -> Result<(), MessengerError>
    where
        F: FnOnce(&mut MessengerConfig),
    {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        let mut candidate = (**guard).clone();
        mutate(&mut candidate);
        candidate.validate()?;

        let next = Arc::new(candidate);
        *guard = next.clone();
        drop(guard);

        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        for listener in listeners.iter() {
            listener(&next);
        }
        Ok(())
    }

    /// Register a listener fired after each successful update.
    pub fn on_update(&self, listener: UpdateListener) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }
}

/// Environment switches controlling rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureFlags {
    /// Master switch. When off, dispatch and scheduling refuse.
    pub enabled: bool,
    /// Email queue rollout flag.
    pub email_queue: bool,
    /// Campaign processing rollout flag.
    pub campaign_processing: bool,
    /// SMS drip rollout flag.
    pub sms_drip: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            enabled: true,
            email_queue: false,
            campaign_processing: false,
            sms_drip: false,
        }
    }
}

impl FeatureFlags {
    /// Read flags from the process environment. The master switch defaults
    /// on; rollout flags default off.
    pub fn from_env() -> Self {
        Self {
            enabled: env_flag(ENV_ENABLED, true),
            email_queue: env_flag(ENV_EMAIL_QUEUE, false),
            campaign_processing: env_flag(ENV_CAMPAIGN_PROCESSING, false),
            sms_drip: env_flag(ENV_SMS_DRIP, false),
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config_with_durable() -> MessengerConfig {
        let mut config = MessengerConfig::default();
        config
            .transports
            .insert("durable".to_string(), TransportConfig::durable());
        config.default_transport = "durable".to_string();
        config
    }

    #[test]
    fn default_config_validates() {
        assert!(MessengerConfig::default().validate().is_ok());
    }

    #[test]
    fn missing_default_transport_fails_validation() {
        let mut config = MessengerConfig::default();
        config.default_transport = "ghost".to_string();
        assert!(matches!(
            config.validate(),
            Err(MessengerError::Configuration(_))
        ));
    }

    #[test]
    fn routing_to_unknown_transport_fails_validation() {
        let mut config = MessengerConfig::default();
        config
            .routing
            .insert("Email".to_string(), vec!["nowhere".to_string()]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn priority_thresholds_must_be_ordered() {
        let mut config = MessengerConfig::default();
        config.priority_routing = Some(PriorityRouting {
            high_threshold: 3,
            low_threshold: 8,
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn retry_policy_falls_back_to_default() {
        let mut config = MessengerConfig::default();
        config.retry.insert(
            "Email".to_string(),
            RetryPolicy {
                max_retries: 5,
                ..Default::default()
            },
        );

        assert_eq!(config.retry_policy_for("Email").max_retries, 5);
        assert_eq!(config.retry_policy_for("Other").max_retries, 3);
    }

    #[test]
    fn failed_update_restores_snapshot_and_skips_listeners() {
        let manager = RuntimeConfigManager::new(config_with_durable()).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_listener = fired.clone();
        manager.on_update(Box::new(move |_| {
            fired_in_listener.fetch_add(1, Ordering::SeqCst);
        }));

        let before = manager.snapshot();
        let result = manager.update(|config| {
            config.transports.remove(&config.default_transport.clone());
        });

        assert!(result.is_err());
        assert_eq!(*manager.snapshot(), *before);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn successful_update_swaps_and_notifies() {
        let manager = RuntimeConfigManager::new(config_with_durable()).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_listener = fired.clone();
        manager.on_update(Box::new(move |_| {
            fired_in_listener.fetch_add(1, Ordering::SeqCst);
        }));

        manager
            .update(|config| {
                config.default_priority = 7;
            })
            .unwrap();

        assert_eq!(manager.snapshot().default_priority, 7);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn default_retry_entry_cannot_be_removed() {
        let manager = RuntimeConfigManager::new(MessengerConfig::default()).unwrap();
        let result = manager.update(|config| {
            config.retry.remove("default");
        });
        assert!(result.is_err());
        assert!(manager.snapshot().retry.contains_key("default"));
    }

    #[test]
    fn feature_flags_default_sensibly() {
        let flags = FeatureFlags::default();
        assert!(flags.enabled);
        assert!(!flags.email_queue);
    }
}
