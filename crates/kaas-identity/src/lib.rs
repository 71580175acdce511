//! Identity federation for workspace virtual clusters
//!
//! Every workspace API server trusts its own issuer. This crate issues the
//! ID tokens those API servers accept, serves the discovery documents and key
//! sets they verify against, rotates the signing keys, and packages tokens
//! into tenant kubeconfigs.

pub mod error;
pub mod keys;
pub mod kubeconfig;
pub mod provider;
pub mod server;

pub use error::IdentityError;
pub use keys::{run_rotation, JwkSet, KeyRing, RotationConfig};
pub use kubeconfig::{generate_kubeconfig, ClusterEndpoint};
pub use provider::{IdentityConfig, IdentityProvider, IssuedToken, TokenClaims};
pub use server::{identity_router, serve, TokenResponse};
