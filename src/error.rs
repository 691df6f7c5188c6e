//! Error types for Switchyard
//!
//! This module defines all custom error types used throughout the daemon.
//! Routing failures are absorbed by the router itself, so `RouterError`
//! only covers control-plane operations.

use std::io;
use thiserror::Error;

/// Main error type for Switchyard operations
#[derive(Error, Debug)]
pub enum SwitchyardError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Routing table error
    #[error("Router error: {0}")]
    Router(#[from] RouterError),

    /// Connection pool error
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    /// Tunnel error
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Outlet error
    #[error("Outlet error: {0}")]
    Outlet(#[from] OutletError),
}

/// Control-plane errors raised by the router
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    /// The referenced outlet is not part of the routing snapshot
    #[error("Outlet not found: {0}")]
    OutletNotFound(String),

    /// An alias points at something that is not a literal outlet
    #[error("Alias {alias} must map to an outlet, got {target}")]
    AliasChain {
        /// Alias name
        alias: String,
        /// The non-outlet target it referenced
        target: String,
    },

    /// Two outlets share the same name
    #[error("Duplicate outlet name: {0}")]
    DuplicateOutlet(String),

    /// Rule could not be inserted
    #[error("Invalid rule: {0}")]
    InvalidRule(String),
}

/// Multiplexed session pool errors
#[derive(Error, Debug)]
pub enum PoolError {
    /// Maximum sessions reached and none of them is healthy
    #[error("Pool exhausted: {max} sessions and none healthy")]
    Exhausted {
        /// Configured session limit
        max: usize,
    },

    /// Creating the underlying session failed
    #[error("Dial failed: {0}")]
    DialFailed(#[source] io::Error),

    /// Opening a stream on a session failed
    #[error("Failed to open stream: {0}")]
    StreamOpen(#[source] io::Error),

    /// The pool has been closed
    #[error("Pool is closed")]
    Closed,
}

/// Tunnel lifecycle and relay errors
#[derive(Error, Debug)]
pub enum TunnelError {
    /// `start` was called more than once
    #[error("Tunnel is already started")]
    AlreadyStarted,

    /// The tunnel was closed before it could run
    #[error("Tunnel is not active")]
    NotActive,

    /// Relay IO failure (end-of-stream is never reported here)
    #[error("Relay error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised while connecting through an outlet
#[derive(Error, Debug)]
pub enum OutletError {
    /// Could not reach the outlet server or the destination
    #[error("Dial failed: {0}")]
    Dial(#[from] io::Error),

    /// The outlet protocol handshake was rejected
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Network or feature not supported by this outlet
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Pool failure that the outlet could not recover from
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),
}

/// Result alias used by library code
pub type Result<T> = std::result::Result<T, SwitchyardError>;
