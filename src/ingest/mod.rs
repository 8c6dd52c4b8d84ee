//! Batch ingestion: tabular county sources into canonical rows.

mod normalizer;
mod resolver;
mod tax_roll;

pub use normalizer::{canonical_parcel_id, normalize_owner_name, party_match_hash};
pub use resolver::{EntityResolver, IngestRecord, UpsertStats};
pub use tax_roll::{
    ingest_adjudicated_list, ingest_geo_shapes, ingest_tax_roll, IngestionStats,
};
