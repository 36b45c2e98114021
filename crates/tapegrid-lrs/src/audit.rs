//! Hardware audit log.
//!
//! Every physical action a device worker attempts produces exactly one
//! catalog log entry and one tracing event, whether it succeeded or not.
//! The entry is written before the outcome reaches any waiter.

use serde_json::Value;
use tapegrid_core::{DeviceId, MediumId, epoch_secs};
use tapegrid_state::{LogCause, LogEntry, StateStore};
use tracing::{error, info, warn};

use crate::adapter::AdapterResult;

#[derive(Clone)]
pub struct AuditLog {
    catalog: StateStore,
}

impl AuditLog {
    pub fn new(catalog: StateStore) -> Self {
        Self { catalog }
    }

    /// Record the outcome of one adapter call. `message` should be a JSON
    /// object describing the action; the adapter error text is added to it
    /// on failure.
    pub fn record<T>(
        &self,
        device: &DeviceId,
        medium: Option<&MediumId>,
        cause: LogCause,
        result: &AdapterResult<T>,
        mut message: Value,
    ) {
        let errno = match result {
            Ok(_) => 0,
            Err(e) => {
                if let Some(fields) = message.as_object_mut() {
                    fields.insert("error".into(), Value::String(e.message.clone()));
                }
                e.code
            }
        };
        let medium_name = medium.map(ToString::to_string).unwrap_or_default();
        if errno == 0 {
            info!(%device, medium = %medium_name, ?cause, "hardware action");
        } else {
            warn!(%device, medium = %medium_name, ?cause, errno, %message, "hardware action failed");
        }

        let entry = LogEntry {
            seq: 0,
            device: device.clone(),
            medium: medium.cloned(),
            cause,
            errno,
            message,
            time: epoch_secs(),
        };
        if let Err(e) = self.catalog.append_log(entry) {
            error!(%device, ?cause, error = %e, "failed to record hardware log entry");
        }
    }
}
