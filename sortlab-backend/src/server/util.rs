use testcontainers_modules::{
    postgres::Postgres,
    testcontainers::{ContainerAsync, ImageExt, runners::AsyncRunner},
};
use uuid::Uuid;

const POSTGRES_TAG: &str = "17-alpine";

/// A throwaway PostgreSQL instance for development servers and tests. The container is removed on drop.
pub struct DevContainer {
    _container: ContainerAsync<Postgres>,
    host: String,
    port: u16,
    db_root_password: Option<String>,
}

impl DevContainer {
    /// Start a container named `{name_prefix}_{random suffix}`. Without a password, connections are trusted.
    ///
    /// # Errors
    pub async fn new(name_prefix: &str, with_password: bool) -> anyhow::Result<Self> {
        let image = Postgres::default();
        let (image, db_root_password) = if with_password {
            let pass = Uuid::new_v4().simple().to_string();
            (image.with_password(&pass), Some(pass))
        } else {
            (image.with_host_auth(), None)
        };

        let container = image
            .with_tag(POSTGRES_TAG)
            .with_container_name(format!("{name_prefix}_{}", Uuid::now_v7().simple()))
            .start()
            .await?;

        let host = container.get_host().await?.to_string();
        let port = container.get_host_port_ipv4(5432).await?;

        Ok(Self {
            _container: container,
            host,
            port,
            db_root_password,
        })
    }

    #[must_use]
    pub fn password(&self) -> Option<&str> {
        self.db_root_password.as_deref()
    }

    #[must_use]
    pub fn db_host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn db_port(&self) -> u16 {
        self.port
    }

    /// Connection URL for the `postgres` superuser
    #[must_use]
    pub fn db_url(&self) -> String {
        let Self {
            host,
            port,
            db_root_password,
            ..
        } = self;

        let credentials = match db_root_password {
            Some(pass) => format!("postgres:{pass}"),
            None => "postgres".to_string(),
        };

        format!("postgres://{credentials}@{host}:{port}/postgres")
    }
}
