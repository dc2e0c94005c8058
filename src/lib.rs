//! # devgate - SSH infrastructure core for the DevTools desktop suite
//!
//! `devgate` is the systems layer behind a desktop developer toolkit. It
//! owns the user's SSH world end to end: a formatting-preserving model of
//! `~/.ssh/config`, credential resolution across keychain and identity
//! files, trust-on-first-use host-key verification, authenticated session
//! dialing with keep-alive, supervised local port forwards, and a watch
//! based folder synchronizer that mirrors local trees to remote hosts over
//! SFTP. A flat, transport-agnostic command surface ties it together for
//! whatever UI sits on top.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use devgate::surface::{App, AppOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let app = App::start(AppOptions::default()).await?;
//!
//!     // Listen to everything the core reports.
//!     let mut events = app.subscribe_events();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("{event:?}");
//!         }
//!     });
//!
//!     // Start a tunnel and watch a profile's sync pairs.
//!     let runtime_id = app
//!         .start_local_forward("bastion", 5433, "db.internal", 5432, "")
//!         .await?;
//!     app.start_watching("my-config-id").await?;
//!
//!     app.stop_forward(&runtime_id).await?;
//!     app.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`sshconfig::SshConfigStore`] - byte-preserving `~/.ssh/config` model
//! - [`auth::CredentialBroker`] - password/keychain/identity-file resolution
//! - [`hostkeys::KnownHosts`] - known-hosts verification and TOFU capture
//! - [`connect::ConnectionFactory`] - session dialing and keep-alive
//! - [`tunnel::TunnelManager`] - supervised local→remote TCP forwards
//! - [`sync::SyncService`] - watch-and-mirror folder sync over SFTP
//! - [`surface::App`] - the command/event façade consumed by the UI

pub mod appconfig;
pub mod auth;
pub mod bridge;
pub mod connect;
pub mod error;
pub mod events;
pub mod hostkeys;
pub mod launcher;
pub mod paths;
pub mod secrets;
pub mod sshconfig;
pub mod surface;
pub mod sync;
pub mod tunnel;

pub use error::{Error, Result};
