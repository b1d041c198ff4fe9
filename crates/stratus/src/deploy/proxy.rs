//! Nginx implementation of the reverse-proxy contract.
//!
//! One conf file per domain in a dedicated directory (expected to be
//! included from the main nginx config), reloaded through a configurable
//! shell command. Certificate issuance shells out to a configurable ACME
//! client command with `{host}` and `{email}` placeholders.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use log::{info, warn};
use tokio::fs;
use tokio::process::Command;

use super::ProxyGateway;

pub struct NginxGateway {
    conf_dir: PathBuf,
    reload_command: String,
    certificate_command: String,
}

impl NginxGateway {
    pub fn new(conf_dir: PathBuf, reload_command: &str, certificate_command: &str) -> Self {
        Self {
            conf_dir,
            reload_command: reload_command.to_string(),
            certificate_command: certificate_command.to_string(),
        }
    }

    fn conf_path(&self, host: &str) -> PathBuf {
        self.conf_dir.join(format!("{}.conf", host))
    }

    async fn write_conf(&self, host: &str, contents: &str) -> Result<()> {
        fs::create_dir_all(&self.conf_dir)
            .await
            .with_context(|| format!("creating conf directory: {}", self.conf_dir.display()))?;
        let path = self.conf_path(host);
        fs::write(&path, contents)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        run_shell(&self.reload_command).await.context("reloading proxy")
    }
}

#[async_trait]
impl ProxyGateway for NginxGateway {
    async fn add_domain(&self, host: &str, port: u16) -> Result<()> {
        self.write_conf(host, &http_server_block(host, port)).await?;
        self.reload().await?;
        info!("Added proxy entry for {} -> 127.0.0.1:{}", host, port);
        Ok(())
    }

    async fn update_domain(&self, host: &str, port: u16, use_tls: bool) -> Result<()> {
        let contents = if use_tls {
            tls_server_block(host, port)
        } else {
            http_server_block(host, port)
        };
        self.write_conf(host, &contents).await?;
        self.reload().await?;
        Ok(())
    }

    async fn remove_domains(&self, hosts: &[String]) -> Result<()> {
        let mut removed = false;
        for host in hosts {
            let path = self.conf_path(host);
            match fs::remove_file(&path).await {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
        if removed {
            self.reload().await?;
        }
        Ok(())
    }

    async fn issue_certificate(&self, host: &str, contact_email: &str) -> Result<()> {
        let command = self
            .certificate_command
            .replace("{host}", host)
            .replace("{email}", contact_email);
        run_shell(&command)
            .await
            .with_context(|| format!("issuing certificate for {}", host))?;
        info!("Issued certificate for {}", host);
        Ok(())
    }
}

async fn run_shell(command: &str) -> Result<()> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .await
        .with_context(|| format!("running: {}", command))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("command {:?} failed: {}", command, stderr.trim());
    }
    Ok(())
}

fn http_server_block(host: &str, port: u16) -> String {
    format!(
        r#"server {{
    listen 80;
    server_name {host};

    location / {{
        proxy_pass http://127.0.0.1:{port};
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection "upgrade";
    }}
}}
"#
    )
}

fn tls_server_block(host: &str, port: u16) -> String {
    format!(
        r#"server {{
    listen 80;
    server_name {host};
    return 301 https://$host$request_uri;
}}

server {{
    listen 443 ssl;
    server_name {host};

    ssl_certificate /etc/letsencrypt/live/{host}/fullchain.pem;
    ssl_certificate_key /etc/letsencrypt/live/{host}/privkey.pem;

    location / {{
        proxy_pass http://127.0.0.1:{port};
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection "upgrade";
    }}
}}
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn gateway(dir: &Path) -> NginxGateway {
        NginxGateway::new(dir.to_path_buf(), "true", "true")
    }

    #[tokio::test]
    async fn test_add_domain_writes_proxy_block() {
        let dir = TempDir::new().unwrap();
        let gw = gateway(dir.path());

        gw.add_domain("app.example.com", 3000).await.unwrap();

        let conf = std::fs::read_to_string(dir.path().join("app.example.com.conf")).unwrap();
        assert!(conf.contains("server_name app.example.com;"));
        assert!(conf.contains("proxy_pass http://127.0.0.1:3000;"));
        assert!(!conf.contains("ssl_certificate"));
    }

    #[tokio::test]
    async fn test_tls_update_rewrites_block() {
        let dir = TempDir::new().unwrap();
        let gw = gateway(dir.path());

        gw.add_domain("app.example.com", 3000).await.unwrap();
        gw.update_domain("app.example.com", 3000, true).await.unwrap();

        let conf = std::fs::read_to_string(dir.path().join("app.example.com.conf")).unwrap();
        assert!(conf.contains("listen 443 ssl;"));
        assert!(conf.contains("/etc/letsencrypt/live/app.example.com/fullchain.pem"));
    }

    #[tokio::test]
    async fn test_remove_domains_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let gw = gateway(dir.path());

        gw.add_domain("app.example.com", 3000).await.unwrap();
        let hosts = vec!["app.example.com".to_string(), "gone.example.com".to_string()];

        gw.remove_domains(&hosts).await.unwrap();
        assert!(!dir.path().join("app.example.com.conf").exists());

        gw.remove_domains(&hosts).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_reload_surfaces() {
        let dir = TempDir::new().unwrap();
        let gw = NginxGateway::new(dir.path().to_path_buf(), "false", "true");

        assert!(gw.add_domain("app.example.com", 3000).await.is_err());
    }
}
