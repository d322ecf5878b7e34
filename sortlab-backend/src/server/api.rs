use axum::{
    Router,
    routing::{get, post, put},
};

use super::AppState;
use crate::db::model::{
    rack::{NewRack, RackView},
    sample::{NewSample, SampleWithPlacement},
    sample_type::SampleType,
};
use handler::{
    by_id, by_query, clear_slot, count_samples, deselect_sample, place_sample, reset_demo,
    select_sample, start_sorting, stop_sorting, update_rack, write,
};

mod error;
mod handler;

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/racks",
            get(by_query::<RackView>).post(write::<NewRack>),
        )
        .route("/racks/{rack_id}", put(update_rack))
        .route(
            "/racks/{rack_id}/slot/{position}",
            post(place_sample).delete(clear_slot),
        )
        .route("/rack-types", get(by_query::<SampleType>))
        .route(
            "/samples",
            get(by_query::<SampleWithPlacement>).post(write::<NewSample>),
        )
        .route("/samples/count", get(count_samples))
        .route("/samples/{sample_id}", get(by_id::<SampleWithPlacement>))
        .route("/samples/{sample_id}/select", post(select_sample))
        .route("/samples/{sample_id}/deselect", post(deselect_sample))
        .route("/sorting/start", post(start_sorting))
        .route("/sorting/stop", post(stop_sorting))
        .route("/sorting/reset", get(reset_demo))
}
