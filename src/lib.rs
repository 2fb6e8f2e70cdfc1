//! A real-time bridge from Art-Net DMX to Philips Hue Entertainment
//! streaming.
//!
//! Ingests Art-Net ArtDmx frames over UDP, maps DMX slots to
//! entertainment-channel color updates per hub, and streams them to one
//! or more Hue bridges over PSK-DTLS at up to 25 Hz, with the keepalive
//! traffic those sessions require. Hub pairing, persistent configuration
//! storage, and any operator-facing UI are out of scope for this crate;
//! it exposes the configuration shape it consumes ([`config::Config`])
//! and the status shape it produces ([`status::RuntimeStatusSnapshot`])
//! for an external front-end to drive.
//!
//! # Basic usage
//!
//! ```no_run
//! use artnet_hue_bridge::config;
//! use artnet_hue_bridge::coordinator::Coordinator;
//! use artnet_hue_bridge::status::RuntimeStatus;
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let config = config::load("config.json").await.expect("valid configuration");
//!     let status = RuntimeStatus::new();
//!     let coordinator = Coordinator::new(config, status).await?;
//!     tokio::signal::ctrl_c().await?;
//!     coordinator.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod artnet;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod dtls;
pub mod error;
pub mod hueapi;
pub mod packet;
pub mod runner;
pub mod status;
