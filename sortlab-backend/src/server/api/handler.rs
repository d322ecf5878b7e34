use std::collections::BTreeMap;

use axum::{
    Json,
    extract::{FromRequest, FromRequestParts, Path, State, rejection::JsonRejection},
    response::{IntoResponse, Response},
};
use axum_extra::extract::{Query, QueryRejection, WithRejection};
use diesel_async::{AsyncConnection, scoped_futures::ScopedFutureExt};
use garde::Validate;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use valuable::Valuable;

use super::error::{Error, Result};
use crate::{
    db::model::{
        FetchById, FetchByQuery, RACK_CAPACITY, Write,
        rack::{Rack, RackUpdate},
        sample::{Sample, SampleCount, SampleQuery, SampleSelection},
        slot::{SlotClearance, SlotPlacement, SlotView},
    },
    equipment::{RpcValue, sequencer::ReplyRole},
    server::{AppState, auth::LabUser},
};

pub(super) struct ValidJson<T>(T);

impl<S, T> FromRequest<S> for ValidJson<T>
where
    axum::Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
    T: Validate,
    <T as Validate>::Context: std::default::Default,
{
    type Rejection = Error;

    async fn from_request(
        req: axum::extract::Request,
        state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        let axum::Json(data) = axum::Json::<T>::from_request(req, state).await?;
        data.validate()?;

        Ok(Self(data))
    }
}

impl<T: Serialize> IntoResponse for ValidJson<T> {
    fn into_response(self) -> Response {
        let Self(inner) = self;

        axum::Json(inner).into_response()
    }
}

pub(super) struct ValidQuery<T>(T);

impl<S, T> FromRequestParts<S> for ValidQuery<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Validate,
    <T as Validate>::Context: std::default::Default,
{
    type Rejection = Error;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        let Query(query) = Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|err: QueryRejection| Error::from(err))?;
        query.validate()?;

        Ok(Self(query))
    }
}

pub(super) async fn write<Data>(
    _user: LabUser,
    State(app_state): State<AppState>,
    ValidJson(data): ValidJson<Data>,
) -> Result<Json<Data::Returns>>
where
    Data: Write + Send + Valuable,
    Data::Returns: Send,
{
    tracing::info!(deserialized_data = data.as_value());

    let mut db_conn = app_state.db_conn().await?;

    let item = db_conn
        .transaction(|conn| async move { data.write(conn).await }.scope_boxed())
        .await?;

    Ok(Json(item))
}

pub(super) async fn by_id<Resource>(
    _user: LabUser,
    State(app_state): State<AppState>,
    WithRejection(Path(resource_id), _): WithRejection<Path<Resource::Id>, Error>,
) -> Result<Json<Resource>>
where
    Resource: FetchById + Send,
    Resource::Id: DeserializeOwned + Send + Sync + Valuable,
{
    tracing::info!(deserialized_id = resource_id.as_value());

    let mut db_conn = app_state.db_conn().await?;

    let item = Resource::fetch_by_id(&resource_id, &mut db_conn).await?;

    Ok(Json(item))
}

pub(super) async fn by_query<Resource>(
    _user: LabUser,
    State(app_state): State<AppState>,
    ValidQuery(query): ValidQuery<Resource::QueryParams>,
) -> Result<Json<Vec<Resource>>>
where
    Resource: FetchByQuery + Send,
    Resource::QueryParams: Send + Sync + Valuable,
{
    tracing::info!(deserialized_query = query.as_value());

    let mut db_conn = app_state.db_conn().await?;

    let items = Resource::fetch_by_query(&query, &mut db_conn).await?;

    Ok(Json(items))
}

#[derive(Serialize)]
pub(super) struct RackUpdated {
    success: bool,
    rack: Rack,
}

pub(super) async fn update_rack(
    _user: LabUser,
    State(app_state): State<AppState>,
    WithRejection(Path(rack_id), _): WithRejection<Path<i32>, Error>,
    ValidJson(mut update): ValidJson<RackUpdate>,
) -> Result<Json<RackUpdated>> {
    update.id = rack_id;
    tracing::info!(deserialized_data = update.as_value());

    let mut db_conn = app_state.db_conn().await?;

    let rack = db_conn
        .transaction(|conn| async move { update.write(conn).await }.scope_boxed())
        .await?;

    Ok(Json(RackUpdated {
        success: true,
        rack,
    }))
}

// Positions arrive as `i32` so that values beyond `i16` are reported like any other bad position
fn slot_position(position: i32) -> Result<i16> {
    i16::try_from(position).map_err(|_| Error::SimpleData {
        reason: format!("position: {position} is not between 1 and {RACK_CAPACITY}"),
    })
}

#[derive(Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub(super) struct PlacementRequest {
    #[serde(alias = "sample_id")]
    #[garde(skip)]
    sample_id: i32,
}

pub(super) async fn place_sample(
    _user: LabUser,
    State(app_state): State<AppState>,
    WithRejection(Path((rack_id, position)), _): WithRejection<Path<(i32, i32)>, Error>,
    ValidJson(PlacementRequest { sample_id }): ValidJson<PlacementRequest>,
) -> Result<Json<SlotView>> {
    let placement = SlotPlacement {
        rack_id,
        position: slot_position(position)?,
        sample_id,
    };
    tracing::info!(deserialized_data = placement.as_value());
    placement.validate()?;

    let mut db_conn = app_state.db_conn().await?;

    let slot = placement.write(&mut db_conn).await?;

    Ok(Json(slot))
}

#[derive(Deserialize, Validate, Default)]
#[serde(default, rename_all = "camelCase")]
pub(super) struct ClearSlotQuery {
    #[garde(skip)]
    expected_sample_id: Option<i32>,
}

pub(super) async fn clear_slot(
    _user: LabUser,
    State(app_state): State<AppState>,
    WithRejection(Path((rack_id, position)), _): WithRejection<Path<(i32, i32)>, Error>,
    ValidQuery(ClearSlotQuery { expected_sample_id }): ValidQuery<ClearSlotQuery>,
) -> Result<Json<SlotView>> {
    let clearance = SlotClearance {
        rack_id,
        position: slot_position(position)?,
        expected_sample_id,
    };
    tracing::info!(deserialized_data = clearance.as_value());
    clearance.validate()?;

    let mut db_conn = app_state.db_conn().await?;

    let slot = db_conn
        .transaction(|conn| async move { clearance.write(conn).await }.scope_boxed())
        .await?;

    Ok(Json(slot))
}

pub(super) async fn count_samples(
    _user: LabUser,
    State(app_state): State<AppState>,
    ValidQuery(query): ValidQuery<SampleQuery>,
) -> Result<Json<SampleCount>> {
    tracing::info!(deserialized_query = query.as_value());

    let mut db_conn = app_state.db_conn().await?;

    Ok(Json(query.count(&mut db_conn).await?))
}

async fn set_selected(app_state: &AppState, id: i32, selected: bool) -> Result<Json<Sample>> {
    let selection = SampleSelection { id, selected };
    tracing::info!(deserialized_data = selection.as_value());

    let mut db_conn = app_state.db_conn().await?;

    Ok(Json(selection.write(&mut db_conn).await?))
}

pub(super) async fn select_sample(
    _user: LabUser,
    State(app_state): State<AppState>,
    WithRejection(Path(id), _): WithRejection<Path<i32>, Error>,
) -> Result<Json<Sample>> {
    set_selected(&app_state, id, true).await
}

pub(super) async fn deselect_sample(
    _user: LabUser,
    State(app_state): State<AppState>,
    WithRejection(Path(id), _): WithRejection<Path<i32>, Error>,
) -> Result<Json<Sample>> {
    set_selected(&app_state, id, false).await
}

pub(super) async fn start_sorting(
    _user: LabUser,
    State(app_state): State<AppState>,
) -> Result<Json<RpcValue>> {
    Ok(Json(app_state.sequencer().start_sorting().await?))
}

pub(super) async fn stop_sorting(
    _user: LabUser,
    State(app_state): State<AppState>,
) -> Result<Json<BTreeMap<ReplyRole, RpcValue>>> {
    Ok(Json(app_state.sequencer().stop_sorting().await?))
}

pub(super) async fn reset_demo(
    _user: LabUser,
    State(app_state): State<AppState>,
) -> Result<Json<BTreeMap<ReplyRole, RpcValue>>> {
    Ok(Json(app_state.sequencer().reset_demo().await?))
}
