//! Service layer orchestrating ledger, content store, records and telemetry

mod provenance;

pub use provenance::{
    AnnotationInput, ProvenanceService, RegisterProductInput, RegisteredProduct, StageInput,
};
