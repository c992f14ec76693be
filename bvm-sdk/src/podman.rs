//! Podman machine discovery and the podman REST API connection.

use std::path::{Path, PathBuf};

use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::backend::{Connector, HostProvider};
use crate::error::BoxError;
use crate::host::HostConnection;

const API_VERSION: &str = "v4.0.0";

// =============================================================================
// Machine discovery
// =============================================================================

/// Discovers the podman machine through `podman machine inspect`.
#[derive(Debug, Clone)]
pub struct PodmanMachine {
    podman_bin: PathBuf,
    name: Option<String>,
}

impl Default for PodmanMachine {
    fn default() -> Self {
        Self {
            podman_bin: PathBuf::from("podman"),
            name: None,
        }
    }
}

impl PodmanMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Path to the podman binary (default: `podman` from `PATH`).
    pub fn podman_bin(mut self, bin: impl Into<PathBuf>) -> Self {
        self.podman_bin = bin.into();
        self
    }

    /// Inspect a named machine instead of the default one.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl HostProvider for PodmanMachine {
    async fn host_connection(&self) -> Result<Option<HostConnection>, BoxError> {
        let mut cmd = Command::new(&self.podman_bin);
        cmd.args(["machine", "inspect"]);
        if let Some(name) = &self.name {
            cmd.arg(name);
        }
        let output = cmd.output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("does not exist") || stderr.contains("no such") {
                return Ok(None);
            }
            return Err(format!("podman machine inspect failed: {}", stderr.trim()).into());
        }
        Ok(parse_machine_inspect(&output.stdout)?)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MachineInspect {
    connection_info: ConnectionInfo,
    #[serde(rename = "SSHConfig")]
    ssh_config: SshConfig,
    #[serde(default)]
    rootful: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConnectionInfo {
    podman_socket: Option<MachineFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MachineFile {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SshConfig {
    identity_path: PathBuf,
}

/// Parse `podman machine inspect` output, taking the first machine.
fn parse_machine_inspect(json: &[u8]) -> Result<Option<HostConnection>, serde_json::Error> {
    let machines: Vec<MachineInspect> = serde_json::from_slice(json)?;
    Ok(machines.into_iter().next().and_then(|m| {
        let socket = m.connection_info.podman_socket?;
        Some(HostConnection {
            socket_path: socket.path,
            ssh_identity: m.ssh_config.identity_path,
            rootful: m.rootful,
        })
    }))
}

// =============================================================================
// REST API connection
// =============================================================================

/// Connects to the podman REST API over a unix socket.
#[derive(Debug, Clone, Copy, Default)]
pub struct PodmanConnector;

impl Connector for PodmanConnector {
    type Connection = PodmanConnection;

    async fn connect(
        &self,
        uri: &str,
        identity: &Path,
        authenticated: bool,
    ) -> Result<PodmanConnection, BoxError> {
        let socket = uri
            .strip_prefix("unix://")
            .ok_or_else(|| format!("unsupported connection URI {uri}, expected unix://"))?;
        let connection = PodmanConnection::new(socket, identity, authenticated)?;
        connection.ping().await?;
        debug!(uri, "connected to podman");
        Ok(connection)
    }
}

/// An open podman API connection.
#[derive(Debug, Clone)]
pub struct PodmanConnection {
    client: reqwest::Client,
    socket_path: PathBuf,
    identity: PathBuf,
    authenticated: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImageInspect {
    id: String,
}

impl PodmanConnection {
    fn new(socket: impl AsRef<Path>, identity: &Path, authenticated: bool) -> reqwest::Result<Self> {
        let socket_path = socket.as_ref().to_owned();
        let client = reqwest::Client::builder()
            .unix_socket(socket_path.as_path())
            .build()?;
        Ok(Self {
            client,
            socket_path,
            identity: identity.to_owned(),
            authenticated,
        })
    }

    pub fn uri(&self) -> String {
        format!("unix://{}", self.socket_path.display())
    }

    pub fn identity(&self) -> &Path {
        &self.identity
    }

    pub fn authenticated(&self) -> bool {
        self.authenticated
    }

    fn url(&self, segments: &[&str]) -> Result<Url, BoxError> {
        // The host is ignored for unix sockets.
        let mut url = Url::parse("http://d")?;
        url.path_segments_mut()
            .map_err(|()| "API URL cannot be a base")?
            .push(API_VERSION)
            .push("libpod")
            .extend(segments);
        Ok(url)
    }

    async fn ping(&self) -> Result<(), BoxError> {
        let resp = self.client.get(self.url(&["_ping"])?).send().await?;
        if !resp.status().is_success() {
            return Err(format!("podman ping returned {}", resp.status()).into());
        }
        Ok(())
    }

    /// Resolve an image reference to its full image id, if present locally.
    pub async fn image_id(&self, image_ref: &str) -> Result<Option<String>, BoxError> {
        let resp = self
            .client
            .get(self.url(&["images", image_ref, "json"])?)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = resp.error_for_status()?;
        let inspect: ImageInspect = resp.json().await?;
        Ok(Some(inspect.id))
    }

    /// Pull an image into the machine's storage.
    pub async fn pull(&self, image_ref: &str) -> Result<(), BoxError> {
        let mut url = self.url(&["images", "pull"])?;
        url.query_pairs_mut()
            .append_pair("reference", image_ref)
            .append_pair("quiet", "true");
        let resp = self.client.post(url).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() || body.contains("\"error\"") {
            return Err(format!("pulling {image_ref} failed: {}", body.trim()).into());
        }
        Ok(())
    }
}
