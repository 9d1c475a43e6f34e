//! Command-line WireGuard driver
//!
//! Programs the interface by shelling out to `wg` and `ip`. The most
//! portable driver, usable anywhere the WireGuard tools are installed.

use super::driver::{Peer, WireGuardDriver};
use crate::{Error, Result};
use async_trait::async_trait;
use ipnet::IpNet;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, trace};

/// Driver executing `wg` and `ip` commands.
pub struct CommandDriver {
    interface: String,
    wg_path: String,
    ip_path: String,
}

impl CommandDriver {
    /// Create a driver for the named interface with default tool paths.
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            wg_path: "wg".to_string(),
            ip_path: "ip".to_string(),
        }
    }

    /// Create a driver with custom tool paths.
    pub fn with_paths(
        interface: impl Into<String>,
        wg_path: impl Into<String>,
        ip_path: impl Into<String>,
    ) -> Self {
        Self {
            interface: interface.into(),
            wg_path: wg_path.into(),
            ip_path: ip_path.into(),
        }
    }

    /// Whether the WireGuard tools are present on this system.
    pub fn is_available(&self) -> bool {
        std::process::Command::new("which")
            .arg(&self.wg_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn exec(&self, cmd: &str, args: &[&str]) -> Result<String> {
        trace!(cmd = cmd, args = ?args, "executing command");
        let output = Command::new(cmd)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Driver(format!("spawn {}: {}", cmd, e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Driver(format!(
                "{} {} failed: {}",
                cmd,
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Write a private key to a file only root can read, for `wg set`.
    fn write_key_file(private_key: &str) -> Result<tempfile::NamedTempFile> {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new()
            .map_err(|e| Error::Driver(format!("create key file: {}", e)))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(file.path(), perms)
                .map_err(|e| Error::Driver(format!("set key file permissions: {}", e)))?;
        }
        file.write_all(private_key.as_bytes())
            .map_err(|e| Error::Driver(format!("write key file: {}", e)))?;
        Ok(file)
    }
}

#[async_trait]
impl WireGuardDriver for CommandDriver {
    async fn configure(&self, private_key: &str, listen_port: u16) -> Result<()> {
        debug!(interface = %self.interface, "configuring interface");
        let key_file = Self::write_key_file(private_key)?;
        let key_path = key_file.path().to_string_lossy().to_string();
        let port = listen_port.to_string();
        self.exec(
            &self.wg_path,
            &[
                "set",
                &self.interface,
                "private-key",
                &key_path,
                "listen-port",
                &port,
            ],
        )
        .await?;
        self.exec(&self.ip_path, &["link", "set", &self.interface, "up"])
            .await?;
        Ok(())
    }

    async fn put_peer(&self, peer: &Peer) -> Result<()> {
        debug!(interface = %self.interface, public_key = %peer.public_key, "putting peer");
        let mut args = vec!["set", self.interface.as_str(), "peer", peer.public_key.as_str()];

        let allowed_ips: Vec<String> =
            peer.allowed_ips.iter().map(|ip| ip.to_string()).collect();
        let allowed_ips = allowed_ips.join(",");
        if !allowed_ips.is_empty() {
            args.push("allowed-ips");
            args.push(&allowed_ips);
        }

        let endpoint;
        if let Some(addr) = peer.endpoint {
            endpoint = addr.to_string();
            args.push("endpoint");
            args.push(&endpoint);
        }

        self.exec(&self.wg_path, &args).await?;
        Ok(())
    }

    async fn remove_peer(&self, public_key: &str) -> Result<()> {
        debug!(interface = %self.interface, public_key = %public_key, "removing peer");
        self.exec(
            &self.wg_path,
            &["set", &self.interface, "peer", public_key, "remove"],
        )
        .await?;
        Ok(())
    }

    async fn add_route(&self, prefix: IpNet) -> Result<()> {
        let dest = prefix.to_string();
        let result = self
            .exec(
                &self.ip_path,
                &["route", "add", &dest, "dev", &self.interface],
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            // The kernel reports an existing route as EEXIST.
            Err(Error::Driver(msg)) if msg.contains("File exists") => {
                Err(Error::RouteExists(prefix))
            }
            Err(e) => Err(e),
        }
    }

    fn name(&self) -> String {
        self.interface.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name() {
        let driver = CommandDriver::new("wgmesh0");
        assert_eq!(driver.name(), "wgmesh0");
    }

    #[test]
    fn test_key_file_contents() {
        let file = CommandDriver::write_key_file("private-key-material").unwrap();
        let contents = std::fs::read_to_string(file.path()).unwrap();
        assert_eq!(contents, "private-key-material");
    }
}
