//! Docker container management for SQL Server testing

use anyhow::{Context, Result};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use trigger_core::{bracket_quote, quote_literal};

use crate::client::MssqlClient;

const SA_PASSWORD: &str = "Trigger_Test_Pass1";

/// Configuration for a test SQL Server container
pub struct MssqlContainer {
    pub container_name: String,
    pub host_port: u16,
    pub image_name: String,
}

impl MssqlContainer {
    pub fn new(container_name: &str, host_port: u16) -> Self {
        Self {
            container_name: container_name.to_string(),
            host_port,
            image_name: "mcr.microsoft.com/mssql/server:2022-latest".to_string(),
        }
    }

    /// ADO connection string for `database` on this container.
    pub fn connection_string(&self, database: &str) -> String {
        format!(
            "Server=tcp:127.0.0.1,{};Database={database};User Id=sa;Password={SA_PASSWORD};TrustServerCertificate=true",
            self.host_port
        )
    }

    pub fn start(&self) -> Result<()> {
        info!("Starting SQL Server container: {}", self.container_name);

        // Remove any leftover container with the same name
        let _ = Command::new("docker")
            .args(["rm", "-f", &self.container_name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        let output = Command::new("docker")
            .args([
                "run",
                "--name",
                &self.container_name,
                "-e",
                "ACCEPT_EULA=Y",
                "-e",
                &format!("MSSQL_SA_PASSWORD={SA_PASSWORD}"),
                "-p",
                &format!("{}:1433", self.host_port),
                "-d",
                &self.image_name,
            ])
            .output()
            .context("Failed to start Docker container")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to start container: {stderr}");
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!("Started container: {}", container_id);
        Ok(())
    }

    /// Waits for SQL Server to accept logins
    pub async fn wait_until_ready(&self, timeout_secs: u64) -> Result<()> {
        info!("Waiting for SQL Server to be ready...");

        let start = Instant::now();
        let timeout = Duration::from_secs(timeout_secs);

        while start.elapsed() < timeout {
            match self.test_connection().await {
                Ok(()) => {
                    info!("SQL Server is ready!");
                    return Ok(());
                }
                Err(e) => {
                    debug!("Connection attempt failed: {e:#}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }

        anyhow::bail!("SQL Server did not become ready within {timeout_secs} seconds")
    }

    async fn test_connection(&self) -> Result<()> {
        let client = self.client("master")?;
        client.batch("SELECT 1").await?;
        client.close().await
    }

    pub fn client(&self, database: &str) -> Result<MssqlClient> {
        MssqlClient::from_connection_string(&self.connection_string(database))
    }

    /// Create a database with change tracking enabled.
    pub async fn create_database(&self, database: &str) -> Result<()> {
        let client = self.client("master")?;
        let name = bracket_quote(database);
        let literal = quote_literal(database);
        client
            .batch(&format!(
                "IF DB_ID({literal}) IS NULL CREATE DATABASE {name};\n\
                 ALTER DATABASE {name} SET CHANGE_TRACKING = ON (CHANGE_RETENTION = 2 DAYS, AUTO_CLEANUP = ON);"
            ))
            .await
            .with_context(|| format!("Failed to create database {database}"))?;
        client.close().await
    }

    pub fn stop(&self) -> Result<()> {
        info!("Stopping container: {}", self.container_name);

        let output = Command::new("docker")
            .args(["rm", "-f", &self.container_name])
            .output()
            .context("Failed to remove container")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!("Failed to remove container (may not exist): {}", stderr);
        }
        Ok(())
    }

    pub fn get_logs(&self) -> Result<String> {
        let output = Command::new("docker")
            .args(["logs", &self.container_name])
            .output()
            .context("Failed to get container logs")?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        Ok(format!("STDOUT:\n{stdout}\n\nSTDERR:\n{stderr}"))
    }
}

impl Drop for MssqlContainer {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
