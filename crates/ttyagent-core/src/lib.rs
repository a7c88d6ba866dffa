//! Core library for the sealos-tty-agent terminal gateway.
//!
//! `ttyagent-core` holds the transport-agnostic pieces of the gateway:
//! everything that can be reasoned about (and tested) without an open
//! socket. The axum frontend (`ttyagent-web`) wires these into the HTTP
//! and WebSocket surfaces.
//!
//! # Modules
//!
//! - [`config`] — effective gateway configuration loaded from a JSON file.
//! - [`ticket`] — single-use, TTL-bound WebSocket tickets ([`TicketStore`]).
//! - [`protocol`] — the JSON control-frame protocol spoken over the WebSocket.
//! - [`target`] — validated exec targets ([`ExecTarget`]).
//! - [`kubeconfig`] — kubeconfig parsing and file-credential inlining.

pub mod config;
pub mod kubeconfig;
pub mod protocol;
pub mod target;
pub mod ticket;

pub use config::{ConfigError, GatewayConfig};
pub use protocol::{parse_client_frame, ClientFrame, FrameError, ServerFrame, TermSize};
pub use target::{ExecTarget, TargetError};
pub use ticket::{ConsumeError, ConsumerMeta, IssuedTicket, IssuerMeta, TicketStore};
