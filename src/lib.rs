//! drive_facade - A small client for Google sign-in and Google Drive.
//!
//! This library provides functionality to:
//! - Sign in with a Google account (OAuth 2.0 with PKCE) and sign out again
//! - Upload files to the Drive root or into a folder
//! - Create folders and move files between folders
//! - List files matching a Drive search query, DICOM files in particular
//!
//! Storage operations run in the background on a bounded pool. Each one
//! reports its result once to the registered [`DriveListener`] and through
//! the [`OperationHandle`] it returns.
//!
//! # Example
//!
//! ```no_run
//! use drive_facade::{DriveConfig, DriveFacade};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let facade = DriveFacade::google(DriveConfig::default())?;
//!     facade.restore_session("refresh-token").await?;
//!
//!     for file in facade.list_dicom_files().wait().await? {
//!         println!("{}", file);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod facade;
pub mod models;

// Re-exports for convenience
pub use auth::{AuthorizationResponse, Credential, IdentityProvider, SignInRequest};
pub use client::{DriveService, ServiceConnector, StorageApi};
pub use config::DriveConfig;
pub use error::{DriveError, Result};
pub use facade::{DriveFacade, DriveListener, OperationHandle, OperationKind};
pub use models::RemoteEntry;
