//! Transport routing.
//!
//! Resolution order for a dispatch: explicit transport in the options, then
//! the message-type routing table (first entry), then priority-band routing,
//! then the default transport.

use crate::config::MessengerConfig;
use crate::error::MessengerError;

/// Resolves the target transport for a dispatch.
#[derive(Debug, Default, Clone, Copy)]
pub struct Router;

impl Router {
    /// Resolve a transport name.
    ///
    /// `explicit` is the caller's `options.transport`; `priority` is the
    /// already-resolved envelope priority.
    pub fn resolve(
        &self,
        config: &MessengerConfig,
        message_type: &str,
        explicit: Option<&str>,
        priority: u8,
    ) -> Result<String, MessengerError> {
        if let Some(name) = explicit {
            if !config.transports.contains_key(name) {
                return Err(MessengerError::Configuration(format!(
                    "transport {name:?} is not configured"
                )));
            }
            return Ok(name.to_string());
        }

        if let Some(targets) = config.routing.get(message_type) {
            if let Some(first) = targets.first() {
                return Ok(first.clone());
            }
        }

        if let Some(pr) = &config.priority_routing {
            let band_target = if priority >= pr.high_threshold {
                pr.high_transport.as_ref()
            } else if priority <= pr.low_threshold {
                pr.low_transport.as_ref()
            } else {
                pr.normal_transport.as_ref()
            };
            if let Some(target) = band_target {
                return Ok(target.clone());
            }
        }

        Ok(config.default_transport.clone())
    }
}
