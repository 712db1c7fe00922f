//! # MedVault Core
//!
//! Clinical-records integrity and compliance engine.
//!
//! This crate owns patient identity, medical history, uploaded clinical documents and the audit
//! trail:
//! - Immutable, self-validating domain values (`domain`)
//! - Sharded YAML tables with patient-scoped referential integrity (`repositories`)
//! - Status state machine, medical records, encrypted document store, consent and audit
//!   services (`services`)
//! - One composition root wiring them together ([`Vault`])
//!
//! **No transport concerns**: authentication, HTTP servers and UI belong in outer layers. The
//! identity of the caller arrives as a [`ids::UserId`] on every operation.

pub mod collaborators;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod domain;
pub mod error;
pub mod ids;
pub mod repositories;
pub mod services;
pub mod vault;

pub use error::{CoreError, CoreResult, OperationContext, RuleCode, ValidationErrors, Violation};
pub use vault::{Collaborators, Vault};
