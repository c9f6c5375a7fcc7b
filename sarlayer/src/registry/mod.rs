//! Scene registry: the durable record of processed scenes and their chips.
//!
//! - [`model`] defines the document and its mutations.
//! - [`RegistryStore`] persists it with atomic replacement, writer locking,
//!   retries and read-back verification.
//! - [`rebuild`] reconstructs it from finalized products; the audit in
//!   [`RegistryStore::validate_registry`] reports products it is missing.

mod audit;
mod error;
mod lock;
pub mod model;
pub mod rebuild;
mod store;

pub use audit::AuditReport;
pub use error::{RegistryError, RegistryResult};
pub use model::{
    ChipRecord, ChipUpdate, DisasterPhase, OutputMap, RegisterEffect, Registry, SceneRecord,
    SceneUpdate, OUTPUT_CLIPPED, OUTPUT_VH, OUTPUT_VV,
};
pub use rebuild::{ChipSidecar, Evidence, EvidenceSource, FilesystemEvidence};
pub use store::{RegistryStore, UpdateCheck};
