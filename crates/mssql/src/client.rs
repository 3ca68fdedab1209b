//! Lazily connected SQL Server client.

use anyhow::{Context, Result};
use tiberius::{Client, Config, Row, ToSql};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, info, warn};

type TdsClient = Client<Compat<TcpStream>>;

/// A single TDS connection shared by one store.
///
/// The connection is opened on first use. Any query failure drops it so the
/// next call reconnects.
pub struct MssqlClient {
    config: Config,
    client: Mutex<Option<TdsClient>>,
}

impl MssqlClient {
    /// Parse an ADO.NET style connection string
    /// (`Server=tcp:host,1433;Database=db;User Id=sa;Password=...`).
    pub fn from_connection_string(connection_string: &str) -> Result<Self> {
        let config = Config::from_ado_string(connection_string)
            .context("Invalid SQL Server connection string")?;
        Ok(Self {
            config,
            client: Mutex::new(None),
        })
    }

    async fn connect(&self) -> Result<TdsClient> {
        let addr = self.config.get_addr();
        debug!("Connecting to SQL Server at {addr}");

        let tcp = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("Failed to connect to SQL Server at {addr}"))?;
        tcp.set_nodelay(true)?;

        let client = match Client::connect(self.config.clone(), tcp.compat_write()).await {
            Ok(client) => client,
            // Azure SQL gateways may redirect the login to another node.
            Err(tiberius::error::Error::Routing { host, port }) => {
                let mut config = self.config.clone();
                config.host(&host);
                config.port(port);
                let tcp = TcpStream::connect(config.get_addr())
                    .await
                    .with_context(|| format!("Failed to follow SQL Server redirect to {host}:{port}"))?;
                tcp.set_nodelay(true)?;
                Client::connect(config, tcp.compat_write())
                    .await
                    .context("Failed to log in to SQL Server after redirect")?
            }
            Err(e) => return Err(anyhow::Error::new(e).context("Failed to log in to SQL Server")),
        };

        info!("Connected to SQL Server at {addr}");
        Ok(client)
    }

    /// Run a parameterized statement (`@P1`, `@P2`, ...) and collect every
    /// result set it produces.
    pub async fn query(&self, sql: &str, params: &[&dyn ToSql]) -> Result<Vec<Vec<Row>>> {
        let mut guard = self.client.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let Some(client) = guard.as_mut() else {
            anyhow::bail!("SQL Server connection is not available");
        };

        let result = match client.query(sql, params).await {
            Ok(stream) => stream.into_results().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(results) => Ok(results),
            Err(e) => {
                warn!("Dropping SQL Server connection after query failure: {e}");
                *guard = None;
                Err(e.into())
            }
        }
    }

    /// Run an unparameterized batch and collect every result set.
    pub async fn batch(&self, sql: &str) -> Result<Vec<Vec<Row>>> {
        let mut guard = self.client.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let Some(client) = guard.as_mut() else {
            anyhow::bail!("SQL Server connection is not available");
        };

        let result = match client.simple_query(sql).await {
            Ok(stream) => stream.into_results().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(results) => Ok(results),
            Err(e) => {
                warn!("Dropping SQL Server connection after batch failure: {e}");
                *guard = None;
                Err(e.into())
            }
        }
    }

    /// Close the connection if one is open.
    pub async fn close(&self) -> Result<()> {
        if let Some(client) = self.client.lock().await.take() {
            client
                .close()
                .await
                .context("Failed to close SQL Server connection")?;
            debug!("Closed SQL Server connection");
        }
        Ok(())
    }
}

/// SQL Server error number of a failed statement, if the server reported one.
pub(crate) fn server_error_code(err: &anyhow::Error) -> Option<u32> {
    err.chain().find_map(|cause| {
        match cause.downcast_ref::<tiberius::error::Error>() {
            Some(tiberius::error::Error::Server(token)) => Some(token.code()),
            _ => None,
        }
    })
}
