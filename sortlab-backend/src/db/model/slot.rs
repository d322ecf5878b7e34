use std::collections::HashMap;

use chrono::NaiveDateTime;
use diesel::{pg::Pg, prelude::*, upsert::excluded};
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use garde::Validate;
use serde::Serialize;
use valuable::Valuable;

use super::{RACK_CAPACITY, sample::TypedSample};
use crate::{
    db::{
        error::{self, Error},
        model::Write,
    },
    schema::{
        rack,
        rack_slot::{
            self, position as position_col, rack_id as rack_id_col, sample_id as sample_id_col,
        },
    },
};

#[derive(Queryable, Selectable, Identifiable, Debug, Clone, PartialEq)]
#[diesel(table_name = rack_slot, check_for_backend(Pg))]
pub(crate) struct RackSlotRow {
    pub id: i32,
    pub rack_id: i32,
    pub position: i16,
    pub sample_id: Option<i32>,
    pub placed_at: NaiveDateTime,
}

/// One position on a rack. Positions without a stored slot row are presented with `sample: None`.
#[derive(Serialize, Debug, Clone, PartialEq, Valuable)]
pub struct SlotView {
    pub rack_id: i32,
    pub position: i16,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[valuable(skip)]
    pub placed_at: Option<NaiveDateTime>,
    pub sample: Option<TypedSample>,
}

impl SlotView {
    #[must_use]
    pub fn empty(rack_id: i32, position: i16) -> Self {
        Self {
            rack_id,
            position,
            placed_at: None,
            sample: None,
        }
    }

    fn from_row(row: RackSlotRow, sample: Option<TypedSample>) -> Self {
        let RackSlotRow {
            rack_id,
            position,
            placed_at,
            ..
        } = row;

        Self {
            rack_id,
            position,
            placed_at: Some(placed_at),
            sample,
        }
    }

    pub(crate) async fn from_rows(
        rows: Vec<RackSlotRow>,
        db_conn: &mut AsyncPgConnection,
    ) -> error::Result<Vec<Self>> {
        let sample_ids: Vec<i32> = rows.iter().filter_map(|r| r.sample_id).collect();
        let mut samples = TypedSample::fetch_many(&sample_ids, db_conn).await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let sample = row.sample_id.and_then(|id| samples.remove(&id));
                Self::from_row(row, sample)
            })
            .collect())
    }
}

/// Expands the stored slots of one rack into exactly `RACK_CAPACITY` views ordered by position.
/// Missing positions are synthesized as empty, stored slots outside the position range are dropped.
#[must_use]
pub fn fill_slots(rack_id: i32, stored: impl IntoIterator<Item = SlotView>) -> Vec<SlotView> {
    let mut by_position: HashMap<i16, SlotView> = stored
        .into_iter()
        .map(|slot| (slot.position, slot))
        .collect();

    (1..=RACK_CAPACITY)
        .map(|position| {
            by_position
                .remove(&position)
                .unwrap_or_else(|| SlotView::empty(rack_id, position))
        })
        .collect()
}

async fn ensure_rack_exists(rack_id: i32, db_conn: &mut AsyncPgConnection) -> error::Result<()> {
    rack::table
        .find(rack_id)
        .select(rack::id)
        .first::<i32>(db_conn)
        .await
        .optional()?
        .map(|_| ())
        .ok_or_else(|| Error::not_found("rack", rack_id))
}

async fn fetch_slot_row(
    rack_id: i32,
    position: i16,
    db_conn: &mut AsyncPgConnection,
) -> error::Result<Option<RackSlotRow>> {
    Ok(rack_slot::table
        .filter(rack_id_col.eq(rack_id))
        .filter(position_col.eq(position))
        .select(RackSlotRow::as_select())
        .first(db_conn)
        .await
        .optional()?)
}

/// Put `sample_id` into slot `position` of rack `rack_id`.
///
/// The slot row is created on first use. The write is a single conditional upsert, so of several
/// concurrent placements into the same empty slot exactly one wins; the others get
/// [`Error::SlotTaken`]. Placing the sample that already occupies the slot succeeds again.
#[derive(Validate, Insertable, Debug, Clone, Copy, Valuable)]
#[diesel(table_name = rack_slot, check_for_backend(Pg))]
pub struct SlotPlacement {
    #[garde(skip)]
    pub rack_id: i32,
    #[garde(range(min = 1, max = RACK_CAPACITY))]
    pub position: i16,
    #[garde(skip)]
    pub sample_id: i32,
}

impl Write for SlotPlacement {
    type Returns = SlotView;

    async fn write(self, db_conn: &mut AsyncPgConnection) -> error::Result<Self::Returns> {
        self.validate()?;

        let Self {
            rack_id,
            position,
            sample_id,
        } = self;

        let upsert = diesel::insert_into(rack_slot::table)
            .values(&self)
            .on_conflict((rack_id_col, position_col))
            .do_update()
            .set(sample_id_col.eq(excluded(sample_id_col)));

        // `QueryDsl::filter` does not cover insert statements, and importing both traits is ambiguous
        let upserted = diesel::query_dsl::methods::FilterDsl::filter(
            upsert,
            sample_id_col
                .is_null()
                .or(sample_id_col.is_not_distinct_from(excluded(sample_id_col))),
        )
        .returning(RackSlotRow::as_returning())
        .get_result(db_conn)
        .await
        .optional()
        .map_err(|err| match Error::from(err) {
            err if err.is_duplicate_of("sample_id") => Error::SampleAlreadyPlaced { sample_id },
            Error::ReferenceNotFound {
                referenced_entity,
                value,
                ..
            } => Error::RecordNotFound {
                entity: Some(referenced_entity),
                id: value,
            },
            err => err,
        })?;

        let Some(row) = upserted else {
            let occupant_id = fetch_slot_row(rack_id, position, db_conn)
                .await?
                .and_then(|row| row.sample_id);

            tracing::debug!(rack_id, position, sample_id, occupant_id, "slot already taken");

            return Err(Error::SlotTaken {
                rack_id,
                position,
                occupant_id,
            });
        };

        let mut views = SlotView::from_rows(vec![row], db_conn).await?;

        views
            .pop()
            .ok_or_else(|| Error::not_found("rack slot", format!("{rack_id}/{position}")))
    }
}

/// Remove the occupant of slot `position` on rack `rack_id`.
///
/// Clearing an empty or never-used slot succeeds. When `expected_sample_id` is set, the slot is
/// only cleared if it holds that sample; a different occupant yields [`Error::OccupantMismatch`].
#[derive(Validate, Debug, Clone, Copy, Valuable)]
pub struct SlotClearance {
    #[garde(skip)]
    pub rack_id: i32,
    #[garde(range(min = 1, max = RACK_CAPACITY))]
    pub position: i16,
    #[garde(skip)]
    pub expected_sample_id: Option<i32>,
}

impl Write for SlotClearance {
    type Returns = SlotView;

    async fn write(self, db_conn: &mut AsyncPgConnection) -> error::Result<Self::Returns> {
        self.validate()?;

        let Self {
            rack_id,
            position,
            expected_sample_id,
        } = self;

        ensure_rack_exists(rack_id, db_conn).await?;

        let target = rack_slot::table
            .filter(rack_id_col.eq(rack_id))
            .filter(position_col.eq(position));

        let cleared = match expected_sample_id {
            Some(expected) => {
                diesel::update(target.filter(sample_id_col.eq(expected)))
                    .set(sample_id_col.eq(None::<i32>))
                    .returning(RackSlotRow::as_returning())
                    .get_result(db_conn)
                    .await
            }
            None => {
                diesel::update(target)
                    .set(sample_id_col.eq(None::<i32>))
                    .returning(RackSlotRow::as_returning())
                    .get_result(db_conn)
                    .await
            }
        }
        .optional()?;

        if let Some(row) = cleared {
            return Ok(SlotView::from_row(row, None));
        }

        match (fetch_slot_row(rack_id, position, db_conn).await?, expected_sample_id) {
            (None, _) => Ok(SlotView::empty(rack_id, position)),
            (
                Some(RackSlotRow {
                    sample_id: Some(occupant_id),
                    ..
                }),
                Some(expected_id),
            ) => Err(Error::OccupantMismatch {
                rack_id,
                position,
                expected_id,
                occupant_id,
            }),
            (Some(row), _) => Ok(SlotView::from_row(row, None)),
        }
    }
}
