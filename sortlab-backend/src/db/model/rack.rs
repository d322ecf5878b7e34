use std::collections::HashMap;

use chrono::NaiveDateTime;
use diesel::{pg::Pg, prelude::*};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use garde::Validate;
use serde::{Deserialize, Serialize};
use valuable::Valuable;

use super::slot::{RackSlotRow, SlotView, fill_slots};
use crate::{
    db::{
        error::{self, Error},
        model::{FetchById, FetchByQuery, Write},
    },
    schema::{
        rack::{self, created_at as created_at_col, id as id_col},
        rack_slot,
    },
};

pub const RFID_LENGTH: usize = 24;

#[derive(Queryable, Selectable, Identifiable, Serialize, Debug, Clone, PartialEq, Valuable)]
#[diesel(table_name = rack, check_for_backend(Pg))]
pub struct Rack {
    pub id: i32,
    pub rfid: String,
    pub sample_type: i32,
    #[valuable(skip)]
    pub created_at: NaiveDateTime,
}

impl FetchById for Rack {
    type Id = i32;

    async fn fetch_by_id(id: &Self::Id, db_conn: &mut AsyncPgConnection) -> error::Result<Self> {
        rack::table
            .find(id)
            .select(Self::as_select())
            .first(db_conn)
            .await
            .optional()?
            .ok_or_else(|| Error::not_found("rack", id))
    }
}

fn sample_type_not_found(err: diesel::result::Error) -> Error {
    match Error::from(err) {
        Error::ReferenceNotFound { value, .. } => Error::RecordNotFound {
            entity: Some("sample type".to_string()),
            id: value,
        },
        err => err,
    }
}

#[derive(Deserialize, Validate, Insertable, Debug, Clone, Valuable)]
#[diesel(table_name = rack, check_for_backend(Pg))]
pub struct NewRack {
    #[garde(length(min = RFID_LENGTH, max = RFID_LENGTH))]
    pub rfid: String,
    #[garde(skip)]
    pub sample_type: i32,
}

impl Write for NewRack {
    type Returns = Rack;

    async fn write(self, db_conn: &mut AsyncPgConnection) -> error::Result<Self::Returns> {
        self.validate()?;

        diesel::insert_into(rack::table)
            .values(&self)
            .returning(Rack::as_returning())
            .get_result(db_conn)
            .await
            .map_err(sample_type_not_found)
    }
}

// Seed racks are matched on RFID, so reseeding leaves existing racks untouched
impl Write for Vec<NewRack> {
    type Returns = usize;

    async fn write(self, db_conn: &mut AsyncPgConnection) -> error::Result<Self::Returns> {
        for new_rack in &self {
            new_rack.validate()?;
        }

        diesel::insert_into(rack::table)
            .values(&self)
            .on_conflict(rack::rfid)
            .do_nothing()
            .execute(db_conn)
            .await
            .map_err(sample_type_not_found)
    }
}

/// Partial update of a rack. Absent fields are left unchanged.
#[derive(Deserialize, Validate, AsChangeset, Identifiable, Debug, Clone, Default, Valuable)]
#[diesel(table_name = rack, check_for_backend(Pg))]
pub struct RackUpdate {
    #[serde(default)]
    #[garde(skip)]
    pub id: i32,
    #[garde(length(min = RFID_LENGTH, max = RFID_LENGTH))]
    pub rfid: Option<String>,
    #[garde(skip)]
    pub sample_type: Option<i32>,
}

impl Write for RackUpdate {
    type Returns = Rack;

    async fn write(self, db_conn: &mut AsyncPgConnection) -> error::Result<Self::Returns> {
        self.validate()?;

        if let RackUpdate {
            rfid: None,
            sample_type: None,
            id,
        } = &self
        {
            return Rack::fetch_by_id(id, db_conn).await;
        }

        diesel::update(&self)
            .set(&self)
            .returning(Rack::as_returning())
            .get_result(db_conn)
            .await
            .optional()
            .map_err(sample_type_not_found)?
            .ok_or_else(|| Error::not_found("rack", self.id))
    }
}

#[derive(Deserialize, Validate, Default, Debug, Clone, Copy, Valuable)]
#[serde(default, rename_all = "camelCase")]
pub struct RackQuery {
    #[garde(skip)]
    pub with_slots: bool,
}

/// A rack as listed to callers. `slots`, when requested, always holds one entry per position.
#[derive(Serialize, Debug, Clone, PartialEq, Valuable)]
pub struct RackView {
    #[serde(flatten)]
    pub rack: Rack,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slots: Option<Vec<SlotView>>,
}

impl FetchByQuery for RackView {
    type QueryParams = RackQuery;

    async fn fetch_by_query(
        query: &Self::QueryParams,
        db_conn: &mut AsyncPgConnection,
    ) -> error::Result<Vec<Self>> {
        let racks: Vec<Rack> = rack::table
            .select(Rack::as_select())
            .order_by((created_at_col.asc(), id_col.asc()))
            .load(db_conn)
            .await?;

        if !query.with_slots {
            return Ok(racks
                .into_iter()
                .map(|rack| Self { rack, slots: None })
                .collect());
        }

        let rack_ids: Vec<i32> = racks.iter().map(|r| r.id).collect();
        let rows = rack_slot::table
            .filter(rack_slot::rack_id.eq_any(&rack_ids))
            .select(RackSlotRow::as_select())
            .load(db_conn)
            .await?;

        let mut stored: HashMap<i32, Vec<SlotView>> = HashMap::with_capacity(racks.len());
        for slot in SlotView::from_rows(rows, db_conn).await? {
            stored.entry(slot.rack_id).or_default().push(slot);
        }

        Ok(racks
            .into_iter()
            .map(|rack| {
                let slots = fill_slots(rack.id, stored.remove(&rack.id).unwrap_or_default());
                Self {
                    rack,
                    slots: Some(slots),
                }
            })
            .collect())
    }
}
