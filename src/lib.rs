#[allow(clippy::all, dead_code)]
pub mod chromeos_update_engine {
    include!(concat!(env!("OUT_DIR"), "/chromeos_update_engine.rs"));
}

pub mod cmd;
pub mod container;
pub mod error;
pub mod extract;
pub mod http;
pub mod operation;
pub mod payload;
pub mod stream;
pub mod writer;

pub use crate::container::{ContainerKind, PayloadStream};
pub use crate::error::{Error, Result};
pub use crate::extract::{
    ExtractObserver, ExtractOptions, NoopObserver, PartitionOutcome, PartitionSummary,
    PayloadExtractor, SizePolicy,
};
pub use crate::payload::PayloadHeader;
