pub mod proto {
    pub mod runner {
        tonic::include_proto!("runner");
    }
}

pub mod classification;
pub mod complex_field;
pub mod config;
pub mod csv_io;
pub mod database;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod join;
pub mod loader;
pub mod metadata;
pub mod primitives;
pub mod pydict;
pub mod rest;
pub mod runner;
pub mod schema_doc;
pub mod search_index;
pub mod split;
pub mod steps;
pub mod verify;

pub use config::IngestConfig;
pub use dispatcher::PrimitiveDispatcher;
pub use engine::{IngestEngine, IngestReport, IngestRequest, IngestStage, IngestStep};
pub use error::{IngestError, Result};
pub use loader::SchemaLoader;
pub use metadata::Metadata;
pub use runner::{GrpcRunner, SolutionRunner};
pub use steps::{StepEngine, StepInput};
