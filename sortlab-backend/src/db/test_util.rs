use chrono::NaiveDateTime;
use diesel_async::{
    AsyncConnection, AsyncPgConnection,
    pooled_connection::{AsyncDieselConnectionManager, deadpool::Pool},
};
use rstest::fixture;
use tokio::sync::OnceCell;
use uuid::Uuid;

use super::{
    model::{rack::NewRack, sample::NewSample, sample_type::SampleType},
    seed_data::SeedData,
};
use crate::server::{run_migrations, util::DevContainer};

pub const SEEDED_SAMPLE_TYPE_ID: i32 = 1;
pub const SEEDED_SAMPLE_TYPE: &str = "Water";
pub const N_SEEDED_RACKS: usize = 3;

// Connections are opened per test because every `#[tokio::test]` has its own runtime
struct TestState {
    _container: DevContainer,
    db_url: String,
}

impl TestState {
    async fn new() -> Self {
        let container = DevContainer::new("sortlab-backend_unit_test", false)
            .await
            .unwrap();
        let db_url = container.db_url();

        let db_config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&db_url);
        let db_pool = Pool::builder(db_config).max_size(1).build().unwrap();
        run_migrations(db_pool.get().await.unwrap()).await.unwrap();

        let mut db_conn = AsyncPgConnection::establish(&db_url).await.unwrap();
        seed_data().write(&mut db_conn).await.unwrap();

        Self {
            _container: container,
            db_url,
        }
    }
}

fn seed_data() -> SeedData {
    let sample_types = [(SEEDED_SAMPLE_TYPE_ID, SEEDED_SAMPLE_TYPE), (2, "Soil")]
        .map(|(id, name)| SampleType {
            id,
            name: name.to_string(),
        })
        .to_vec();

    let racks = (0..N_SEEDED_RACKS).map(|_| new_rack()).collect();

    SeedData {
        sample_types,
        racks,
    }
}

static TEST_STATE: OnceCell<TestState> = OnceCell::const_new();
pub type DbConnection = AsyncPgConnection;

/// A connection that is not shared with any other test, for tests that need to commit
pub async fn fresh_connection() -> DbConnection {
    let test_state = TEST_STATE.get_or_init(TestState::new).await;

    AsyncPgConnection::establish(&test_state.db_url)
        .await
        .unwrap()
}

#[fixture]
pub async fn db_conn() -> DbConnection {
    fresh_connection().await
}

/// A unique, well-formed RFID tag
pub fn rfid() -> String {
    let hex = Uuid::new_v4().simple().to_string();

    hex[..24].to_uppercase()
}

pub fn new_rack() -> NewRack {
    NewRack {
        rfid: rfid(),
        sample_type: SEEDED_SAMPLE_TYPE_ID,
    }
}

pub fn new_sample() -> NewSample {
    NewSample {
        supplier: "Fjord Water Works".to_string(),
        matrix: "drinking water".to_string(),
        sample_taken_time: NaiveDateTime::default(),
        sample_type: SEEDED_SAMPLE_TYPE_ID,
        batch_id: Some("B-17".to_string()),
        storage_temp: Some(4.0),
        comment: None,
    }
}
