//! # DPO I/O - Reference Data Object Backends
//!
//! This crate provides the concrete data object and connection backends for
//! DPO pipelines, plus the builder turning a parsed pipeline configuration
//! into live instances. The orchestrator core only ever sees these types
//! through its capability traits.
//!
//! ## Backends
//!
//! ### Tables
//! - **MemTable**: in-memory partitioned table with append, overwrite and
//!   primary-key merge save modes
//! - **JsonFileTable**: newline-delimited JSON files under hive-style
//!   `col=value/` partition directories
//!
//! ### Streams
//! - **MemStream**: in-memory micro-batch source with offset checkpoints
//!
//! ### Connections
//! - **LocalFsConnection**: local directory access through a bounded
//!   session pool
//!
//! ## Example Usage
//!
//! ```no_run
//! use dpo_core::{InstanceRegistry, PipelineConfig};
//! use dpo_io::build_instances;
//!
//! # fn example() -> dpo_core::Result<()> {
//! let yaml = std::fs::read_to_string("pipeline.yml").unwrap();
//! let config = PipelineConfig::from_yaml(&yaml)?;
//! let instances = build_instances(&config, InstanceRegistry::new())?;
//! # Ok(())
//! # }
//! ```

/// In-memory partitioned table
pub mod mem_table;

/// Partitioned newline-delimited JSON file table
pub mod json_table;

/// In-memory micro-batch stream source
pub mod mem_stream;

/// Local filesystem connection with a pooled session
pub mod fs_connection;

/// Configuration to instance builder
pub mod builder;

pub use builder::{build_instances, Instances};
pub use fs_connection::{FsSession, LocalFsConnection};
pub use json_table::JsonFileTable;
pub use mem_stream::MemStream;
pub use mem_table::MemTable;
