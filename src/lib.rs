#![cfg_attr(docsrs, feature(doc_cfg))]
//! # jbdbms_lib
//!
//! This crate implements the serial protocol of JBD/Xiaoxiang-style BMS
//! (Battery Management System) devices: request framing, response
//! validation, telemetry decoding, edge-triggered fault counting and the
//! MOSFET control command.
//!
//! The protocol engine is transport-agnostic: [`session::BmsSession`] talks
//! to anything implementing [`session::Transport`]. A blocking serial
//! implementation ships behind the `serialport` feature.
//!
//! ## Features
//!
//! This crate uses a feature-based system to keep dependencies minimal.
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling
//!   the `jbdbms` command-line tool.
//!
//! ### Client Features
//! - `serialport`: Enables the blocking serial transport using the
//!   `serialport` crate.
//!
//! ### Utility Features
//! - `serde`: Enables `serde` support for serializing/deserializing the
//!   telemetry and fault data structures.
//! - `bin-dependencies`: Enables all features required by the `jbdbms`
//!   binary executable.

/// Contains error types for the library.
mod error;
/// Edge-triggered fault-occurrence counters.
pub mod fault;
/// Frame encoding, response validation and field decoding.
pub mod protocol;
/// Poll-cycle orchestration over a byte transport.
pub mod session;

pub use error::Error;

/// Blocking serial transport.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub mod serialport;
