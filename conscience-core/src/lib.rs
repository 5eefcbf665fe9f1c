#![forbid(unsafe_code)]

//! Core types, configuration, and score expressions for the conscience
//! service registry.

pub mod config;
pub mod error;
pub mod expr;
pub mod types;

pub use config::{ConscienceConfig, ScorePolicy, ScorePolicyConfig};
pub use error::{Error, Result};
pub use expr::Expr;
pub use types::{Score, ServiceAddr, ServiceType, SCORE_MAX};
