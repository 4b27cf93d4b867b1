//! Hostname of a host, through the `hostname` command.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;

use crate::connection::{ProcessResult, RunOptions};
use crate::error::Result;
use crate::inventory::MultihostHost;
use crate::utility::{mark_used, Utility, UtilityState};

/// Reads and changes the system hostname.
///
/// The first [`HostnameUtils::set_name`] remembers the current name, which is
/// restored on teardown.
#[derive(Debug)]
pub struct HostnameUtils {
    state: UtilityState,
    host: Arc<dyn MultihostHost>,
    original: Mutex<Option<String>>,
}

impl HostnameUtils {
    /// Creates the utility for `host`.
    pub fn new(host: Arc<dyn MultihostHost>) -> Self {
        let logger = host.base().logger().clone();
        Self {
            state: UtilityState::new("hostname", logger),
            host,
            original: Mutex::new(None),
        }
    }

    async fn hostname(&self, flag: Option<&str>) -> Result<String> {
        mark_used(self).await?;
        let mut argv = vec!["hostname"];
        argv.extend(flag);
        let result = self.host.conn().exec(&argv, RunOptions::new()).await?;
        Ok(result.stdout().trim().to_string())
    }

    /// Current hostname.
    pub async fn name(&self) -> Result<String> {
        self.hostname(None).await
    }

    /// Host name without the domain (`hostname -s`).
    pub async fn short_name(&self) -> Result<String> {
        self.hostname(Some("-s")).await
    }

    /// Fully qualified domain name (`hostname -f`).
    pub async fn fqdn(&self) -> Result<String> {
        self.hostname(Some("-f")).await
    }

    /// DNS domain name (`hostname -d`).
    pub async fn domain(&self) -> Result<String> {
        self.hostname(Some("-d")).await
    }

    /// Address the hostname resolves to (`hostname -i`).
    pub async fn ip_address(&self) -> Result<String> {
        self.hostname(Some("-i")).await
    }

    /// Every configured address of the host (`hostname -I`).
    pub async fn all_ip_addresses(&self) -> Result<Vec<String>> {
        let output = self.hostname(Some("-I")).await?;
        Ok(output.split_whitespace().map(String::from).collect())
    }

    /// Sets the hostname. Usually requires root.
    pub async fn set_name(&self, name: &str) -> Result<ProcessResult> {
        if self.original.lock().is_none() {
            let current = self.name().await?;
            self.original.lock().get_or_insert(current);
        }

        self.state
            .logger()
            .info(format!("Setting hostname of {} to {name}", self.host.hostname()));
        self.host.conn().exec(&["hostname", name], RunOptions::new()).await
    }
}

#[async_trait]
impl Utility for HostnameUtils {
    fn state(&self) -> &UtilityState {
        &self.state
    }

    async fn teardown(&self) -> Result<()> {
        let original = self.original.lock().take();
        if let Some(name) = original {
            self.host.conn().exec(&["hostname", &name], RunOptions::new()).await?;
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
