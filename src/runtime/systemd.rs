//! systemd unit reload over the system D-Bus.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::debug;
use zbus::zvariant::OwnedObjectPath;

use crate::error::{KbuError, Result};
use crate::runtime::ServiceReloader;

const SYSTEMD_DESTINATION: &str = "org.freedesktop.systemd1";
const SYSTEMD_PATH: &str = "/org/freedesktop/systemd1";
const SYSTEMD_MANAGER: &str = "org.freedesktop.systemd1.Manager";
const RELOAD_TIMEOUT: Duration = Duration::from_secs(300);

pub struct SystemdReloader {
    address: String,
}

impl SystemdReloader {
    /// `address` is a D-Bus address such as `unix:path=/run/dbus/system_bus_socket`.
    pub fn new(address: String) -> Self {
        Self { address }
    }

    async fn reload_and_wait(&self, unit: &str) -> zbus::Result<String> {
        let connection = zbus::connection::Builder::address(self.address.as_str())?
            .build()
            .await?;
        let manager =
            zbus::Proxy::new(&connection, SYSTEMD_DESTINATION, SYSTEMD_PATH, SYSTEMD_MANAGER)
                .await?;

        // Job signals are only delivered to subscribed clients.
        manager.call_method("Subscribe", &()).await?;
        let mut removed = manager.receive_signal("JobRemoved").await?;

        let job: OwnedObjectPath = manager.call("ReloadUnit", &(unit, "replace")).await?;
        debug!(%unit, job = %job.as_str(), "Queued reload job");

        while let Some(signal) = removed.next().await {
            let (_id, path, _unit, result): (u32, OwnedObjectPath, String, String) =
                signal.body().deserialize()?;
            if path == job {
                return Ok(result);
            }
        }
        Err(zbus::Error::Failure(
            "JobRemoved signal stream ended".to_string(),
        ))
    }
}

#[async_trait]
impl ServiceReloader for SystemdReloader {
    async fn reload(&self, unit: &str) -> Result<()> {
        let result = tokio::time::timeout(RELOAD_TIMEOUT, self.reload_and_wait(unit))
            .await
            .map_err(|_| KbuError::Reload(unit.to_string(), "timed out".to_string()))?
            .map_err(|e| KbuError::Reload(unit.to_string(), e.to_string()))?;
        if result != "done" {
            return Err(KbuError::Reload(
                unit.to_string(),
                format!("reload job finished with result {result}"),
            ));
        }
        Ok(())
    }
}
