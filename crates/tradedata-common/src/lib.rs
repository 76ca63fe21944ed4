//! TradeData Common Library
//!
//! Shared types, utilities, and error handling for the TradeData workspace.
//!
//! # Overview
//!
//! - **Types**: reporting periods, trade flows and the published dataset families
//! - **Checksums**: archive integrity verification
//! - **Logging**: tracing subscriber bootstrap shared by every binary
//! - **Error Handling**: the common error and result types
//!
//! # Example
//!
//! ```no_run
//! use tradedata_common::{Period, Result};
//! use tradedata_common::checksum::Checksum;
//!
//! fn verify(path: &str, published: &str) -> Result<()> {
//!     let period: Period = "2020-01".parse()?;
//!     let expected: Checksum = published.parse()?;
//!     expected.verify_file(path)?;
//!     tracing::info!(%period, "archive verified");
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

pub use error::{Result, TradeDataError};
pub use types::{Dataset, Period, TradeFlow};
