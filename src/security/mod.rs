//! Security core
//!
//! Declarative permissions with wildcard implication, the per-module
//! permission store, resource accounting and artifact verification.

pub mod manager;
pub mod permissions;
pub mod resources;
pub mod signers;
pub mod verifier;

pub use manager::{PermissionManager, SYSTEM_PRINCIPAL};
pub use permissions::{
    glob_match, Permission, PermissionAction, PermissionCollection, PermissionType,
};
pub use resources::{
    ResourceKind, ResourceLimit, ResourceLimiter, ResourceUsage, ResourceViolation,
    ViolationSeverity,
};
pub use signers::{TrustedSigner, TrustedSignerRegistry};
pub use verifier::{DigestVerifier, ModuleVerifier, UnsignedVerifier, VerificationResult};
