//! An intrusion detection and prevention engine core.
//!
//! Talon ingests raw packets from a live interface or an offline capture,
//! reconstructs the transport-layer state of every observed flow, evaluates a
//! signature set against packet payloads and reassembled streams, and emits
//! alerts or applies an accept/drop verdict on each packet.
//!
//! The engine is a directed pipeline of stages connected by bounded packet
//! queues: source, decoder, flow manager, TCP stream engine, detection
//! engine, verdict/response, and output fan-out. Stages run on parallel OS
//! threads; synchronisation is explicit (condvar-backed queues, per-flow
//! mutexes) and the detection structures are read-only after build.
//!
//! A minimal offline run:
//!
//! ```no_run
//! use talon_core::config::default_config;
//! use talon_core::detect::DetectEngine;
//! use talon_core::runtime::Runtime;
//!
//! let mut cfg = default_config();
//! cfg.source.pcap_file = Some("./traces/smallFlows.pcap".to_string());
//! let rules = r#"alert tcp any any -> any 80 (msg:"test"; content:"evil"; sid:1;)"#;
//! let detect = DetectEngine::from_rules(rules, &cfg.detect).unwrap();
//! let runtime = Runtime::new(cfg, detect).unwrap();
//! runtime.run().unwrap();
//! ```

pub mod applayer;
pub mod config;
pub mod decode;
pub mod detect;
pub mod flow;
pub mod memory;
pub mod mpm;
pub mod output;
pub mod packet;
pub mod pipeline;
pub mod protocols;
pub mod respond;
pub mod runtime;
pub mod source;
pub mod stats;
pub mod stream;
pub mod utils;

pub use self::flow::{Flow, FlowKey};
pub use self::packet::Packet;
pub use self::runtime::Runtime;

#[macro_use]
extern crate lazy_static;
