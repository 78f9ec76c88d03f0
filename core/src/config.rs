//! Configuration options.
//!
//! The engine is configured from a TOML file with nested sections for the
//! packet pool, flow table, stream engine, detection, pipeline layout, and
//! outputs. The path is typically a command line argument of the embedding
//! application; [`default_config`] provides a workable offline setup for
//! demos and tests.

use crate::stream::OsPolicy;

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Loads a configuration file from `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RuntimeConfig> {
    let config_str = fs::read_to_string(&path)
        .with_context(|| format!("reading config {}", path.as_ref().display()))?;
    let config: RuntimeConfig =
        toml::from_str(&config_str).context("invalid configuration file")?;
    config.validate()?;
    Ok(config)
}

/// A default configuration: offline mode, moderate table sizes. Not tuned
/// for performance.
pub fn default_config() -> RuntimeConfig {
    RuntimeConfig::default()
}

/* --------------------------------------------------------------------------------- */

/// Runtime configuration options.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Packet pool settings.
    #[serde(default)]
    pub mempool: MempoolConfig,

    /// Packet source settings. Exactly one of `pcap_file` / `interface`
    /// must be set.
    #[serde(default)]
    pub source: SourceConfig,

    /// Flow table settings.
    #[serde(default)]
    pub flow: FlowConfig,

    /// TCP stream engine settings.
    #[serde(default)]
    pub stream: StreamConfig,

    /// Detection engine settings.
    #[serde(default)]
    pub detect: DetectConfig,

    /// Pipeline/thread layout settings.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Output settings.
    #[serde(default)]
    pub outputs: OutputsConfig,
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.source.pcap_file.is_some() == self.source.interface.is_some() {
            bail!("configure exactly one of source.pcap_file and source.interface");
        }
        if self.stream.chunk_len_init == 0 || self.stream.chunk_len_steady == 0 {
            bail!("stream chunk lengths must be non-zero");
        }
        Ok(())
    }
}

/// Packet pool sizing.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct MempoolConfig {
    /// Maximum packets alive at once.
    #[serde(default = "default_mempool_capacity")]
    pub capacity: usize,
    /// Buffers built eagerly at startup.
    #[serde(default = "default_mempool_prealloc")]
    pub prealloc: usize,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        MempoolConfig {
            capacity: default_mempool_capacity(),
            prealloc: default_mempool_prealloc(),
        }
    }
}

fn default_mempool_capacity() -> usize {
    8192
}

fn default_mempool_prealloc() -> usize {
    1024
}

/// Packet source selection.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct SourceConfig {
    /// Offline mode: read this capture file.
    #[serde(default)]
    pub pcap_file: Option<String>,
    /// Online mode: sniff this interface.
    #[serde(default)]
    pub interface: Option<String>,
    /// Snap length for live captures.
    #[serde(default = "default_snaplen")]
    pub snaplen: i32,
    /// Promiscuous mode for live captures.
    #[serde(default = "default_promisc")]
    pub promisc: bool,
}

fn default_snaplen() -> i32 {
    65535
}

fn default_promisc() -> bool {
    true
}

/// Flow table settings. Timeouts are in seconds and are decision-time
/// values compared against each flow's last-seen timestamp.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct FlowConfig {
    #[serde(default = "default_flow_hash_size")]
    pub hash_size: usize,
    #[serde(default = "default_flow_hash_seed")]
    pub hash_seed: u64,
    /// Maximum tracked flows before emergency mode.
    #[serde(default = "default_max_flows")]
    pub max_flows: usize,
    /// Reclamation pass interval, milliseconds.
    #[serde(default = "default_flow_manager_interval")]
    pub manager_interval: u64,

    #[serde(default = "default_tcp_timeout_new")]
    pub tcp_timeout_new: u64,
    #[serde(default = "default_tcp_timeout_established")]
    pub tcp_timeout_established: u64,
    #[serde(default = "default_tcp_timeout_closed")]
    pub tcp_timeout_closed: u64,
    #[serde(default = "default_tcp_emerg_timeout_new")]
    pub tcp_emerg_timeout_new: u64,
    #[serde(default = "default_tcp_emerg_timeout_established")]
    pub tcp_emerg_timeout_established: u64,
    #[serde(default = "default_tcp_emerg_timeout_closed")]
    pub tcp_emerg_timeout_closed: u64,

    #[serde(default = "default_udp_timeout_new")]
    pub udp_timeout_new: u64,
    #[serde(default = "default_udp_timeout_established")]
    pub udp_timeout_established: u64,
    #[serde(default = "default_udp_emerg_timeout_new")]
    pub udp_emerg_timeout_new: u64,
    #[serde(default = "default_udp_emerg_timeout_established")]
    pub udp_emerg_timeout_established: u64,

    #[serde(default = "default_icmp_timeout")]
    pub icmp_timeout: u64,
    #[serde(default = "default_icmp_emerg_timeout")]
    pub icmp_emerg_timeout: u64,

    #[serde(default = "default_default_timeout")]
    pub default_timeout: u64,
    #[serde(default = "default_default_emerg_timeout")]
    pub default_emerg_timeout: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        toml::from_str("").expect("default flow config")
    }
}

fn default_flow_hash_size() -> usize {
    65536
}

fn default_flow_hash_seed() -> u64 {
    0x74616c6f
}

fn default_max_flows() -> usize {
    262_144
}

fn default_flow_manager_interval() -> u64 {
    1000
}

fn default_tcp_timeout_new() -> u64 {
    60
}

fn default_tcp_timeout_established() -> u64 {
    3600
}

fn default_tcp_timeout_closed() -> u64 {
    120
}

fn default_tcp_emerg_timeout_new() -> u64 {
    10
}

fn default_tcp_emerg_timeout_established() -> u64 {
    300
}

fn default_tcp_emerg_timeout_closed() -> u64 {
    20
}

fn default_udp_timeout_new() -> u64 {
    30
}

fn default_udp_timeout_established() -> u64 {
    300
}

fn default_udp_emerg_timeout_new() -> u64 {
    10
}

fn default_udp_emerg_timeout_established() -> u64 {
    100
}

fn default_icmp_timeout() -> u64 {
    30
}

fn default_icmp_emerg_timeout() -> u64 {
    10
}

fn default_default_timeout() -> u64 {
    30
}

fn default_default_emerg_timeout() -> u64 {
    10
}

/// TCP stream engine settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct StreamConfig {
    /// Pick up flows first observed after the 3-way handshake.
    #[serde(default = "default_midstream")]
    pub midstream: bool,
    /// Byte cap for buffered out-of-order segments across all flows.
    #[serde(default = "default_reassembly_memcap")]
    pub reassembly_memcap: u64,
    /// Bytes needed before the first stream message of a direction is
    /// emitted. Smaller values cut the latency to first inspection of
    /// short preambles (banners, request lines).
    #[serde(default = "default_chunk_len_init")]
    pub chunk_len_init: usize,
    /// Bytes needed for subsequent stream messages. Larger values give the
    /// matcher more cross-segment context per scan.
    #[serde(default = "default_chunk_len_steady")]
    pub chunk_len_steady: usize,
    /// Seconds an unfilled sequence hole may stall a stream before a gap
    /// message is emitted and delivery continues past it.
    #[serde(default = "default_gap_timeout")]
    pub gap_timeout: u64,
    /// Default end-host policy for reset validation and overlap handling.
    #[serde(default)]
    pub os_policy: OsPolicy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        toml::from_str("").expect("default stream config")
    }
}

fn default_midstream() -> bool {
    true
}

fn default_reassembly_memcap() -> u64 {
    64 << 20
}

fn default_chunk_len_init() -> usize {
    256
}

fn default_chunk_len_steady() -> usize {
    2048
}

fn default_gap_timeout() -> u64 {
    10
}

/// Detection engine settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DetectConfig {
    /// Multi-pattern matcher implementation. Only `b2g` is built in.
    #[serde(default = "default_mpm")]
    pub mpm: String,
    /// Abort startup on rule parse errors instead of skipping bad rules.
    #[serde(default)]
    pub init_errors_fatal: bool,
}

impl Default for DetectConfig {
    fn default() -> Self {
        DetectConfig {
            mpm: default_mpm(),
            init_errors_fatal: false,
        }
    }
}

fn default_mpm() -> String {
    "b2g".to_string()
}

/// Runmode names, mirroring the CLI surface.
#[derive(Deserialize, Serialize, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Pick a sensible mode for the source (workers for files).
    #[default]
    Auto,
    /// Separate receive/decode thread feeding flow-pinned workers.
    AutoFp,
    /// Each worker runs the full slot chain.
    Workers,
}

/// Pipeline/thread layout settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PipelineConfig {
    #[serde(default)]
    pub runmode: RunMode,
    /// Stream/detect worker threads in autofp mode.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Bound on each inter-stage packet queue.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Optional CPU set per stage family (`receive`, `worker`, `output`,
    /// `management`).
    #[serde(default)]
    pub affinity: AffinityConfig,
    /// Stats aggregation interval, seconds.
    #[serde(default = "default_stats_interval")]
    pub stats_interval: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        toml::from_str("").expect("default pipeline config")
    }
}

fn default_workers() -> usize {
    2
}

fn default_queue_depth() -> usize {
    1024
}

fn default_stats_interval() -> u64 {
    8
}

/// CPU affinity sets, by stage family.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct AffinityConfig {
    #[serde(default)]
    pub receive: Vec<usize>,
    #[serde(default)]
    pub worker: Vec<usize>,
    #[serde(default)]
    pub output: Vec<usize>,
    #[serde(default)]
    pub management: Vec<usize>,
}

/// Output settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct OutputsConfig {
    /// Directory that relative log filenames resolve under.
    #[serde(default = "default_log_dir")]
    pub default_log_dir: String,
    #[serde(default)]
    pub unified_alert: Option<UnifiedFileConfig>,
    #[serde(default)]
    pub unified_log: Option<UnifiedFileConfig>,
    #[serde(default)]
    pub http_log: Option<HttpLogConfig>,
}

impl Default for OutputsConfig {
    fn default() -> Self {
        OutputsConfig {
            default_log_dir: default_log_dir(),
            unified_alert: None,
            unified_log: None,
            http_log: None,
        }
    }
}

fn default_log_dir() -> String {
    ".".to_string()
}

/// Settings shared by the unified binary writers.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct UnifiedFileConfig {
    /// Filename prefix; the open timestamp is appended.
    pub filename: String,
    /// Rotation threshold in bytes.
    #[serde(default = "default_unified_size_limit")]
    pub size_limit: u64,
}

fn default_unified_size_limit() -> u64 {
    10 << 20
}

/// Flat HTTP log settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct HttpLogConfig {
    pub filename: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let cfg = default_config();
        assert_eq!(cfg.mempool.capacity, 8192);
        assert!(cfg.stream.midstream);
        assert_eq!(cfg.stream.chunk_len_init, 256);
        assert_eq!(cfg.pipeline.runmode, RunMode::Auto);
    }

    #[test]
    fn parses_partial_toml() {
        let cfg: RuntimeConfig = toml::from_str(
            r#"
            [source]
            pcap_file = "./t.pcap"

            [flow]
            max_flows = 100
            tcp_timeout_established = 600

            [stream]
            midstream = false
            os_policy = "linux"

            [outputs]
            default_log_dir = "/var/log/talon"

            [outputs.unified_alert]
            filename = "unified.alert"
            size_limit = 64
            "#,
        )
        .unwrap();
        assert_eq!(cfg.flow.max_flows, 100);
        assert_eq!(cfg.flow.tcp_timeout_new, 60); // default retained
        assert!(!cfg.stream.midstream);
        assert_eq!(cfg.stream.os_policy, OsPolicy::Linux);
        let ua = cfg.outputs.unified_alert.unwrap();
        assert_eq!(ua.size_limit, 64);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_requires_exactly_one_source() {
        let cfg = RuntimeConfig::default();
        assert!(cfg.validate().is_err());
        let cfg: RuntimeConfig = toml::from_str(
            r#"
            [source]
            pcap_file = "a.pcap"
            interface = "eth0"
            "#,
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }
}
