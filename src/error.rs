// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the TCP event-tracking engine.
//!
//! No error defined here is allowed to escape a `record_*` entry point
//! (spec §7): callers log and drop. These types exist so that the internal
//! plumbing can use ordinary `?`-based control flow instead of threading
//! success booleans by hand.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("fd {0} is already occupied by a live connection")]
    SlotOccupied(i32),
    #[error("fd {0} is negative")]
    NegativeFd(i32),
}

#[derive(Debug, Error)]
pub enum JsonSinkError {
    #[error("connection has no on-disk directory")]
    NoDirectory,
    #[error("failed to open events file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to resolve a capture device")]
    NoDevice,
    #[error("failed to open capture handle: {0}")]
    OpenFailed(String),
    #[error("failed to compile or install BPF filter: {0}")]
    FilterFailed(String),
    #[error("failed to open pcap dump file: {0}")]
    DumpOpenFailed(String),
    #[error("failed to spawn capture thread: {0}")]
    ThreadSpawnFailed(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ForceBindError {
    #[error("every ephemeral port in [{0}, {1}] refused with EADDRINUSE")]
    Exhausted(u16, u16),
    #[error("bind() failed unexpectedly: {0}")]
    Unexpected(#[from] nix::Error),
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("logs root directory is not set or not readable")]
    LogsRootUnreadable,
    #[error("failed to create numbered logs subdirectory: {0}")]
    CreateLogsDir(#[from] std::io::Error),
}
