//! Credential refresh, rotation, metadata and introspection.
//!
//! This module provides:
//!
//! - The upstream exchange seam ([`TokenExchanger`])
//! - Refresh with rotation ([`TokenRefreshService`])
//! - Credential metadata persistence ([`MetadataStore`])
//! - Token introspection (RFC 7662)
//! - Unverified JWT payload decoding

pub mod exchange;
pub mod introspection;
pub mod jwt;
pub mod metadata;
pub mod refresh;

pub use exchange::{DynTokenExchanger, ExchangeError, HttpTokenExchanger, TokenExchanger};
pub use introspection::{IntrospectionRequest, IntrospectionResponse, TokenIntrospector};
pub use jwt::{JwtClaims, decode_unverified};
pub use metadata::MetadataStore;
pub use refresh::{REFRESH_OPERATION, RefreshOutcome, RefreshRequest, TokenRefreshService};
