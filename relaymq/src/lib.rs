// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![warn(missing_docs)]

//! Per-session MQTT v3.1.1 message processor with QoS state machines and
//! topic fan-out.
//!
//! Each connection runs one [`session::Processor`] task that consumes framed
//! control packets, pairs acknowledgments against the session's pending
//! queues, fans application messages out to subscribers through the shared
//! [`topics::TopicManager`], and queues protocol replies for a single writer
//! task. The CONNECT handshake, transport setup and session persistence are
//! the connection supervisor's concern.

pub use crate::session::{ProcessorOptions, ProcessorOptionsBuilder, ProcessorOptionsBuilderError};

pub mod control_packet;
pub mod error;
pub mod frame;
pub mod outbound;
pub mod session;
pub mod topic;
pub mod topics;

#[macro_use]
extern crate derive_builder;

//----------------------------------------------------------------------

/// Include the README doc on a struct when running doctests to validate that the code in the
/// README can compile to verify that it has not rotted.
/// Note that any code that requires network or environment setup will not be able to run,
/// and thus should be annotated by "no_run" in the README.
#[doc = include_str!("../README.md")]
#[cfg(doctest)]
struct ReadmeDoctests;
