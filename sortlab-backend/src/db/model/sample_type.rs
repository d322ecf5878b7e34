use diesel::{pg::Pg, prelude::*};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use garde::Validate;
use serde::{Deserialize, Serialize};
use valuable::Valuable;

use crate::{
    db::{
        error,
        model::{FetchByQuery, Write},
    },
    schema::sample_type::{self, id as id_col},
};

#[derive(
    Queryable, Selectable, Insertable, Serialize, Deserialize, Validate, Debug, Clone, PartialEq, Valuable,
)]
#[diesel(table_name = sample_type, check_for_backend(Pg))]
pub struct SampleType {
    #[garde(skip)]
    pub id: i32,
    #[garde(length(min = 1, max = 50))]
    pub name: String,
}

/// Sample types are a small lookup table, so they are never filtered
#[derive(Deserialize, Validate, Default, Debug, Valuable)]
pub struct AllSampleTypes {}

impl FetchByQuery for SampleType {
    type QueryParams = AllSampleTypes;

    async fn fetch_by_query(
        _query: &Self::QueryParams,
        db_conn: &mut AsyncPgConnection,
    ) -> error::Result<Vec<Self>> {
        Ok(sample_type::table
            .select(Self::as_select())
            .order_by(id_col)
            .load(db_conn)
            .await?)
    }
}

// Seeding is repeated on every startup, so existing rows are left alone
impl Write for Vec<SampleType> {
    type Returns = usize;

    async fn write(self, db_conn: &mut AsyncPgConnection) -> error::Result<Self::Returns> {
        for sample_type in &self {
            sample_type.validate()?;
        }

        Ok(diesel::insert_into(sample_type::table)
            .values(&self)
            .on_conflict_do_nothing()
            .execute(db_conn)
            .await?)
    }
}
