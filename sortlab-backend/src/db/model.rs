use super::error;
use diesel_async::AsyncPgConnection;

pub mod rack;
pub mod sample;
pub mod sample_type;
pub mod slot;

/// Number of slot positions on every rack. Positions are numbered `1..=RACK_CAPACITY`.
pub const RACK_CAPACITY: i16 = 10;

pub trait Write {
    type Returns;

    fn write(
        self,
        db_conn: &mut AsyncPgConnection,
    ) -> impl Future<Output = error::Result<Self::Returns>> + Send;
}

pub trait FetchById: Sized {
    type Id;

    fn fetch_by_id(
        id: &Self::Id,
        db_conn: &mut AsyncPgConnection,
    ) -> impl Future<Output = error::Result<Self>> + Send;
}

pub trait FetchByQuery: Sized {
    type QueryParams;

    fn fetch_by_query(
        query: &Self::QueryParams,
        db_conn: &mut AsyncPgConnection,
    ) -> impl Future<Output = error::Result<Vec<Self>>> + Send;
}
