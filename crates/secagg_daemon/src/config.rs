//! TOML configuration for the aggregator and clients.

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Protocol parameters shared by the aggregator and every client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Expected number of clients (`n`).
    pub expected_clients: usize,
    /// Shamir threshold (`t`). When absent, `⌈0.8·n⌉`.
    #[serde(default)]
    pub threshold: Option<usize>,
    /// Per-phase wait in seconds (`W`). Phases time out independently.
    #[serde(default = "default_phase_wait")]
    pub phase_wait_secs: u64,
    /// Grace window after the signature-map fan-out in which dissent
    /// messages fail the round.
    #[serde(default = "default_dissent_grace")]
    pub dissent_grace_secs: u64,
    /// Rounds to run back to back.
    #[serde(default = "default_rounds")]
    pub rounds: u64,
    /// Slice lengths of the flattened input tensors.
    pub shape: Vec<usize>,
}

fn default_phase_wait() -> u64 {
    300
}
fn default_dissent_grace() -> u64 {
    10
}
fn default_rounds() -> u64 {
    1
}

impl ProtocolConfig {
    /// Effective threshold: configured value or `⌈0.8·n⌉`.
    pub fn threshold(&self) -> usize {
        self.threshold
            .unwrap_or_else(|| (self.expected_clients * 4).div_ceil(5))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.expected_clients == 0 {
            bail!("expected_clients must be nonzero");
        }
        if self.expected_clients > 255 {
            bail!("expected_clients exceeds the secret-sharing limit of 255");
        }
        let t = self.threshold();
        if t == 0 || t > self.expected_clients {
            bail!(
                "threshold {t} outside 1..={n}",
                n = self.expected_clients
            );
        }
        if self.shape.is_empty() || self.shape.iter().any(|&s| s == 0) {
            bail!("shape must list nonzero slice lengths");
        }
        Ok(())
    }
}

/// Transport used to distribute the phase-1 key directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyDirTransport {
    /// Per-client TCP delivery (reliable; the default).
    #[default]
    Tcp,
    /// UDP broadcast with chunked datagrams. Lossy: a dropped datagram
    /// silently removes the client from the round.
    Broadcast,
}

/// Endpoint layout. The five phase ports accept client submissions; the
/// broadcast port carries the key directory in `broadcast` mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    #[serde(default = "default_aggregator_host")]
    pub aggregator_host: String,
    #[serde(default = "default_advertise_port")]
    pub advertise_port: u16,
    #[serde(default = "default_share_port")]
    pub share_port: u16,
    #[serde(default = "default_masking_port")]
    pub masking_port: u16,
    #[serde(default = "default_consistency_port")]
    pub consistency_port: u16,
    #[serde(default = "default_unmasking_port")]
    pub unmasking_port: u16,
    #[serde(default = "default_broadcast_port")]
    pub broadcast_port: u16,
    /// Target address for broadcast datagrams.
    #[serde(default = "default_broadcast_host")]
    pub broadcast_host: String,
    #[serde(default)]
    pub key_dir_transport: KeyDirTransport,
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}
fn default_aggregator_host() -> String {
    "127.0.0.1".to_string()
}
fn default_advertise_port() -> u16 {
    20000
}
fn default_share_port() -> u16 {
    20001
}
fn default_masking_port() -> u16 {
    20002
}
fn default_consistency_port() -> u16 {
    20003
}
fn default_unmasking_port() -> u16 {
    20004
}
fn default_broadcast_port() -> u16 {
    10000
}
fn default_broadcast_host() -> String {
    "255.255.255.255".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            aggregator_host: default_aggregator_host(),
            advertise_port: default_advertise_port(),
            share_port: default_share_port(),
            masking_port: default_masking_port(),
            consistency_port: default_consistency_port(),
            unmasking_port: default_unmasking_port(),
            broadcast_port: default_broadcast_port(),
            broadcast_host: default_broadcast_host(),
            key_dir_transport: KeyDirTransport::default(),
        }
    }
}

/// Aggregator-only settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Delivery address (`host:port`) per client id, used for key-directory,
    /// inbox, survivor-set, and signature-map fan-out.
    #[serde(default)]
    pub clients: BTreeMap<String, String>,
    /// Where to write the aggregate vector as JSON after a successful round.
    #[serde(default)]
    pub output_path: Option<PathBuf>,
}

/// Client-only settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// This client's id. Usually overridden on the command line.
    #[serde(default)]
    pub id: String,
    /// Port the client listens on for aggregator deliveries.
    #[serde(default = "default_delivery_port")]
    pub delivery_port: u16,
    /// Path to the 32-byte ed25519 signing key file.
    #[serde(default = "default_key_path")]
    pub key_path: PathBuf,
    /// JSON file holding this round's input vector.
    #[serde(default)]
    pub input_path: Option<PathBuf>,
}

fn default_delivery_port() -> u16 {
    10001
}
fn default_key_path() -> PathBuf {
    PathBuf::from("client.key")
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            delivery_port: default_delivery_port(),
            key_path: default_key_path(),
            input_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the TOML directory of long-term public keys.
    // must precede the section tables: TOML emits root values first
    #[serde(default = "default_directory_path")]
    pub directory_path: PathBuf,
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

fn default_directory_path() -> PathBuf {
    PathBuf::from("directory.toml")
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing config {}", path.display()))?;
        config.protocol.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let toml = toml::to_string_pretty(self)?;
        fs::write(path, toml).with_context(|| format!("writing config {}", path.display()))?;
        Ok(())
    }
}
