//! This crate provides a library for constructing an FTP application-level
//! gateway.
//!
//! The gateway terminates client FTP command connections, relays each one to
//! an upstream FTP server, and intercepts the address negotiation so every
//! data channel is established through the gateway instead of directly
//! between client and server.
//!
//! # Feature
//! ## Active mode
//!
//! A client `PORT h1,h2,h3,h4,p1,p2` command is parsed, the gateway connects
//! toward the client's advertised address, opens its own listener facing the
//! server, and forwards a `PORT` line advertising that listener. The server
//! therefore connects to the gateway, never to the client.
//!
//! ## Passive mode
//!
//! A client `PASV` command is relayed unmodified and the server's
//! `227 Entering Passive Mode (...)` reply is intercepted: the gateway
//! connects toward the server's advertised address, opens a listener facing
//! the client, and forwards a rewritten `227` advertising that listener.
//!
//! ## Relay
//!
//! Everything else on the command channel, and every byte on a data channel,
//! is relayed verbatim in both directions. All sessions are driven by a
//! single-threaded, level-triggered readiness loop.
//!
//! # Usage
//!
//! This crate can be used by adding `ftpgate` to your dependencies in your
//! project's `Cargo.toml`.
//!
//! ```toml
//! [dependencies]
//! ftpgate = "0.1.0"
//! ```
//!
//! ## Server
//!
//! Here is a minimum gateway example.
//!
//! ```rust
//! use std::sync::atomic::{AtomicBool, Ordering};
//! use std::sync::Arc;
//! use std::{thread, time::Duration};
//! use ftpgate::*;
//!
//! let config = GatewayConfig::new(
//!     "127.0.0.1".parse().unwrap(),
//!     0, // ephemeral listen port
//!     "127.0.0.1:21".parse().unwrap(),
//! );
//! let mut server = Server::new(config).unwrap();
//! let running = Arc::new(AtomicBool::new(true));
//! let flag = running.clone();
//! let th = thread::spawn(move || server.serve(flag));
//! thread::sleep(Duration::from_millis(100));
//! running.store(false, Ordering::Relaxed);
//! th.join().unwrap().unwrap();
//! ```

pub mod command;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod poll;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;

pub use config::*;
pub use error::{Error, Result};
pub use server::*;
