//! # Heatline
//!
//! Follows the live hierarchy of competitions, distances and heats on a
//! message broker and pushes the raw event bytes to websocket clients.
//!
//! ## Modules
//!
//! - [`broker`]: Broker boundary and the in-memory broker
//! - [`events`]: Activation and raw event decoding
//! - [`source`]: Activation and event streams per hierarchy level
//! - [`follower`]: The self-maintaining tree of followed entities
//! - [`hub`]: Websocket fan-out server
//! - [`recorder`]: Recording and replaying hub output
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use heatline::broker::MemoryBroker;
//! use heatline::follower::Follower;
//! use heatline::source::Source;
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = Arc::new(MemoryBroker::new());
//!     let follower = Follower::new(Source::new(broker));
//!
//!     let token = CancellationToken::new();
//!     let mut competitions = follower
//!         .run(&token, Duration::from_secs(24 * 3600), &[])
//!         .await?;
//!
//!     while let Some(mut competition) = competitions.recv().await {
//!         println!("Following {}", competition.key());
//!         while let Some(distance) = competition.next_child().await {
//!             println!("  distance {}", distance.key());
//!         }
//!     }
//!
//!     token.cancel();
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod events;
pub mod follower;
pub mod hub;
pub mod recorder;
pub mod scope;
pub mod source;

pub use broker::{Broker, BrokerError, MemoryBroker, StartPosition};
pub use config::{Config, ConfigError};
pub use events::{CompetitionActivated, DistanceActivated, HeatActivated, HeatKey, Raw, Signal};
pub use follower::{CompetitionContext, DistanceContext, Follower, HeatContext};
pub use hub::{build_router, serve, AppState, HubError};
pub use recorder::RecorderError;
pub use source::{Source, SourceError};
