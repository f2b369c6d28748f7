#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::float_cmp,
    clippy::implicit_clone,
    clippy::items_after_statements,
    clippy::manual_let_else,
    clippy::map_unwrap_or,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]

pub mod arena;
pub mod contract;
pub mod error;
pub mod federation;
pub mod fitness;
pub mod fusion;
pub mod gene;
pub mod kernel;
pub mod mutation;
pub mod orchestrator;
pub mod pathway;
pub mod phenotype;
pub mod pool;
pub mod project;
pub mod registry;
pub mod regression;
pub mod safety;
pub mod snapshot;
pub mod telemetry;
pub mod topology;
pub mod verify;

pub use contract::{
    BlastRadius, ContractStore, GeneContract, GeneFamily, PathwayContract, TopologyContract,
};
pub use error::Error;
pub use kernel::{Kernel, SharedKernel};
pub use mutation::{MutationContext, MutationEngine};
pub use orchestrator::Orchestrator;
pub use phenotype::PhenotypeMap;
pub use project::Project;
pub use registry::{Allele, AlleleState, Registry};
