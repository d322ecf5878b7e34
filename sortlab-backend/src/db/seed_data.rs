use anyhow::Context;
use diesel_async::AsyncPgConnection;
use serde::Deserialize;

use super::model::{Write, rack::NewRack, sample_type::SampleType};

/// Lookup data and racks that must exist before the lab can work. Rewritten on every startup.
#[derive(Deserialize, Default, Clone, Debug)]
#[serde(default)]
pub struct SeedData {
    pub sample_types: Vec<SampleType>,
    pub racks: Vec<NewRack>,
}

impl SeedData {
    /// # Errors
    pub async fn write(self, db_conn: &mut AsyncPgConnection) -> anyhow::Result<()> {
        let Self {
            sample_types,
            racks,
        } = self;

        let n_sample_types = sample_types
            .write(db_conn)
            .await
            .context("failed to insert sample types")?;

        let n_racks = racks
            .write(db_conn)
            .await
            .context("failed to insert racks")?;

        tracing::debug!(n_sample_types, n_racks, "seeded database");

        Ok(())
    }
}
