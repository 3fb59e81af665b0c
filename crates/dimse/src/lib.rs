//! DIMSE (DICOM Message Service Element) implementation
//!
//! This crate provides both Service Class Provider (SCP) and Service Class User (SCU)
//! implementations for DICOM networking using the DIMSE protocol.
//!
//! # Features
//! - Inbound DIMSE services (SCP): C-ECHO, C-STORE, C-FIND, C-GET, C-MOVE
//! - Outbound DIMSE services (SCU): C-ECHO, C-STORE, C-FIND
//! - Binary stream handling with minimal file I/O

pub mod config;
pub mod error;
pub mod scp;
pub mod scu;
pub mod types;

// Re-export commonly used types
pub use config::{DimseConfig, RemoteNode};
pub use error::{DimseError, Result};
pub use scp::{DimseScp, QueryProvider};
pub use scu::DimseScu;
pub use types::{DatasetStream, DimseCommand};

/// DIMSE protocol version
pub const DIMSE_VERSION: &str = "0.1.0";

/// Default DICOM port
pub const DEFAULT_DIMSE_PORT: u16 = 11112;
