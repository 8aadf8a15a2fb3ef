//! # protorec
//!
//! Parameter and prototype recovery for call sites in a p-code data-flow
//! graph.
//!
//! This crate provides:
//! - Storage entries describing where an ABI passes parameters
//! - Prototype models built from entry lists, with storage assignment
//! - Trials: candidate parameter locations and their pass-by-pass status
//! - Ancestor analysis deciding whether a value was really moved into a
//!   storage location before a call
//! - Function prototypes with locking, parameter shifting and extra-pop
//!   resolution
//! - Per-call-site recovery that rewrites call operands and outputs from
//!   the recovered prototype
//!
//! The graph itself lives in [`protorec_core`].

pub mod ancestor;
pub mod callspecs;
pub mod config;
pub mod entry;
pub mod error;
pub mod heuristics;
pub mod model;
pub mod proto;
pub mod store;
pub mod trial;
pub mod types;

pub use ancestor::AncestorRealistic;
pub use callspecs::{count_matching_calls, FuncCallSpecs, TransferPlan};
pub use config::RecoveryConfig;
pub use entry::{Containment, EntryFlags, Extension, ParamEntry, SlotAddress};
pub use error::{ProtoError, Result};
pub use heuristics::{ancestor_op_use, CallerHeuristics, DefaultHeuristics};
pub use model::{
    lookup_effect, EffectRecord, EffectType, ParamList, ProtoModel, StandardModel,
    StandardModelBuilder, StorageAssignment,
};
pub use proto::{FuncProto, ProtoFlags, PrototypePieces};
pub use store::{InternalStore, ParamFlags, ParameterPieces, ProtoParameter, ProtoStore};
pub use trial::{ParamActive, ParamTrial, TrialFlags, TrialStatus};
pub use types::{DataType, MetaType, TypeClass};
