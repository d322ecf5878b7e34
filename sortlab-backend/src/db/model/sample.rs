use std::collections::HashMap;

use chrono::NaiveDateTime;
use diesel::{pg::Pg, prelude::*};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use garde::Validate;
use serde::{Deserialize, Serialize};
use valuable::Valuable;

use crate::{
    db::{
        error::{self, Error},
        model::{FetchById, FetchByQuery, Write},
    },
    schema::{
        rack, rack_slot,
        sample::{self, created_at as created_at_col, id as id_col, selected as selected_col},
        sample_type,
    },
};

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, PartialEq, Valuable)]
#[diesel(table_name = sample, check_for_backend(Pg))]
pub struct Sample {
    pub id: i32,
    pub supplier: String,
    pub matrix: String,
    #[valuable(skip)]
    pub sample_taken_time: NaiveDateTime,
    pub sample_type: i32,
    pub batch_id: Option<String>,
    pub storage_temp: Option<f32>,
    pub comment: Option<String>,
    pub selected: bool,
    #[valuable(skip)]
    pub created_at: NaiveDateTime,
}

/// A sample together with the name of its sample type, as nested into slot views
#[derive(Serialize, Debug, Clone, PartialEq, Valuable)]
pub struct TypedSample {
    #[serde(flatten)]
    pub sample: Sample,
    pub type_name: String,
}

impl TypedSample {
    pub(crate) async fn fetch_many(
        ids: &[i32],
        db_conn: &mut AsyncPgConnection,
    ) -> error::Result<HashMap<i32, Self>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let samples: Vec<(Sample, String)> = sample::table
            .inner_join(sample_type::table)
            .filter(id_col.eq_any(ids))
            .select((Sample::as_select(), sample_type::name))
            .load(db_conn)
            .await?;

        Ok(samples
            .into_iter()
            .map(|(sample, type_name)| (sample.id, Self { sample, type_name }))
            .collect())
    }
}

#[derive(Serialize, Debug, Clone, PartialEq, Valuable)]
pub struct Placement {
    pub rack_id: i32,
    pub rfid: String,
    pub position: i16,
}

#[derive(Serialize, Debug, Clone, PartialEq, Valuable)]
pub struct SampleWithPlacement {
    #[serde(flatten)]
    pub sample: TypedSample,
    pub placement: Option<Placement>,
}

impl SampleWithPlacement {
    async fn attach_placements(
        samples: Vec<(Sample, String)>,
        db_conn: &mut AsyncPgConnection,
    ) -> error::Result<Vec<Self>> {
        let ids: Vec<i32> = samples.iter().map(|(s, _)| s.id).collect();

        let occupied_slot = rack_slot::sample_id.assume_not_null();
        let placements: Vec<(i32, i32, String, i16)> = rack_slot::table
            .inner_join(rack::table)
            .filter(rack_slot::sample_id.is_not_null())
            .filter(occupied_slot.eq_any(&ids))
            .select((occupied_slot, rack::id, rack::rfid, rack_slot::position))
            .load(db_conn)
            .await?;

        let mut placements: HashMap<i32, Placement> = placements
            .into_iter()
            .map(|(sample_id, rack_id, rfid, position)| {
                (
                    sample_id,
                    Placement {
                        rack_id,
                        rfid,
                        position,
                    },
                )
            })
            .collect();

        Ok(samples
            .into_iter()
            .map(|(sample, type_name)| Self {
                placement: placements.remove(&sample.id),
                sample: TypedSample { sample, type_name },
            })
            .collect())
    }
}

impl FetchById for SampleWithPlacement {
    type Id = i32;

    async fn fetch_by_id(id: &Self::Id, db_conn: &mut AsyncPgConnection) -> error::Result<Self> {
        let found = sample::table
            .inner_join(sample_type::table)
            .filter(id_col.eq(id))
            .select((Sample::as_select(), sample_type::name))
            .first(db_conn)
            .await
            .optional()?
            .ok_or_else(|| Error::not_found("sample", id))?;

        let mut with_placement = Self::attach_placements(vec![found], db_conn).await?;

        with_placement
            .pop()
            .ok_or_else(|| Error::not_found("sample", id))
    }
}

#[derive(Deserialize, Validate, Default, Debug, Valuable)]
#[serde(default)]
pub struct SampleQuery {
    #[garde(range(min = 1))]
    pub limit: Option<i64>,
    #[garde(skip)]
    pub selected: Option<bool>,
}

impl FetchByQuery for SampleWithPlacement {
    type QueryParams = SampleQuery;

    async fn fetch_by_query(
        query: &Self::QueryParams,
        db_conn: &mut AsyncPgConnection,
    ) -> error::Result<Vec<Self>> {
        let SampleQuery { limit, selected } = query;

        let mut statement = sample::table
            .inner_join(sample_type::table)
            .select((Sample::as_select(), sample_type::name))
            .order_by((created_at_col.asc(), id_col.asc()))
            .into_boxed();

        if let Some(selected) = selected {
            statement = statement.filter(selected_col.eq(*selected));
        }

        if let Some(limit) = limit {
            statement = statement.limit(*limit);
        }

        let samples = statement.load(db_conn).await?;

        Self::attach_placements(samples, db_conn).await
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Valuable)]
pub struct SampleCount {
    pub count: i64,
}

impl SampleQuery {
    /// Count the samples matching this query. `limit` is ignored.
    pub async fn count(&self, db_conn: &mut AsyncPgConnection) -> error::Result<SampleCount> {
        let mut statement = sample::table.count().into_boxed();

        if let Some(selected) = self.selected {
            statement = statement.filter(selected_col.eq(selected));
        }

        let count = statement.get_result(db_conn).await?;

        Ok(SampleCount { count })
    }
}

#[derive(Deserialize, Validate, Insertable, Debug, Clone, Valuable)]
#[diesel(table_name = sample, check_for_backend(Pg))]
#[garde(allow_unvalidated)]
pub struct NewSample {
    #[garde(length(min = 1, max = 255))]
    pub supplier: String,
    #[garde(length(min = 1, max = 255))]
    pub matrix: String,
    #[valuable(skip)]
    pub sample_taken_time: NaiveDateTime,
    pub sample_type: i32,
    #[garde(length(max = 255))]
    pub batch_id: Option<String>,
    pub storage_temp: Option<f32>,
    #[garde(length(max = 255))]
    pub comment: Option<String>,
}

impl Write for NewSample {
    type Returns = Sample;

    async fn write(self, db_conn: &mut AsyncPgConnection) -> error::Result<Self::Returns> {
        self.validate()?;

        let result = diesel::insert_into(sample::table)
            .values(&self)
            .returning(Sample::as_returning())
            .get_result(db_conn)
            .await;

        result.map_err(|err| match Error::from(err) {
            Error::ReferenceNotFound { .. } => Error::not_found("sample type", self.sample_type),
            err => err,
        })
    }
}

/// Marks a sample as (de)selected for the next batch sort
#[derive(Debug, Clone, Copy, Valuable)]
pub struct SampleSelection {
    pub id: i32,
    pub selected: bool,
}

impl Write for SampleSelection {
    type Returns = Sample;

    async fn write(self, db_conn: &mut AsyncPgConnection) -> error::Result<Self::Returns> {
        let Self { id, selected } = self;

        diesel::update(sample::table.find(id))
            .set(selected_col.eq(selected))
            .returning(Sample::as_returning())
            .get_result(db_conn)
            .await
            .optional()?
            .ok_or_else(|| Error::not_found("sample", id))
    }
}
