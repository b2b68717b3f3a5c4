//! Types library for the card price index pipeline
//!
//! This library provides the core type definitions shared by the ingestion,
//! aggregation, cache and broadcast layers. It performs no I/O.
//!
//! # Modules
//! - `ids`: Integer identities (CardId, MarketplaceId)
//! - `numeric`: Currency codes and decimal price helpers
//! - `variant`: Canonical variant dimensions (Condition, Language) and filters
//! - `snapshot`: Raw quotes and canonical snapshot fact rows
//! - `errors`: Row-level validation taxonomy

// Public modules
pub mod ids;
pub mod numeric;
pub mod variant;
pub mod snapshot;
pub mod errors;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::ids::*;
    pub use crate::numeric::*;
    pub use crate::variant::*;
    pub use crate::snapshot::*;
    pub use crate::errors::*;
}
