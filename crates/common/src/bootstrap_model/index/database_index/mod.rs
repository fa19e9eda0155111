mod backfill_state;
mod index_config;
mod index_state;
mod indexed_fields;

pub use self::{
    backfill_state::{
        DatabaseIndexBackfillState,
        SerializedDatabaseIndexBackfillState,
    },
    index_config::{
        DatabaseIndexSpec,
        SerializedDatabaseIndexSpec,
    },
    index_state::{
        DatabaseIndexState,
        SerializedDatabaseIndexState,
    },
    indexed_fields::IndexedFields,
};
