use std::{fs, time::Duration};

use anyhow::{Context, bail};
use camino::Utf8PathBuf;
use clap::{Args, Parser};
use url::Url;

use crate::{
    db::seed_data::SeedData,
    equipment::sequencer::{FailurePolicy, JobCodes, SequencerSettings},
};

pub const LOGIN_USER: &str = "login_user";
pub const FRONTEND_USER: &str = "sortlab-frontend";

#[derive(Args, serde::Deserialize, Clone, Debug)]
pub struct Config {
    #[arg(long, default_value_t)]
    #[serde(default)]
    dev: bool,
    #[arg(long)]
    secrets_dir: Option<Utf8PathBuf>,
    #[arg(long, env = "SORTLAB_DB_ROOT_USER", default_value_t)]
    db_root_user: String,
    #[arg(long, env = "SORTLAB_DB_ROOT_PASSWORD", default_value_t)]
    db_root_password: String,
    #[arg(long, env = "SORTLAB_DB_LOGIN_USER_PASSWORD", default_value_t)]
    db_login_user_password: String,
    #[arg(long, env = "SORTLAB_DB_HOST", default_value_t = String::from("localhost"))]
    db_host: String,
    #[arg(long, env = "SORTLAB_DB_PORT", default_value_t = 5432)]
    db_port: u16,
    #[arg(long, env = "SORTLAB_DB_NAME", default_value_t)]
    db_name: String,
    #[arg(long, env = "SORTLAB_FRONTEND_TOKEN", default_value_t)]
    frontend_token: String,
    #[arg(long, env = "SORTLAB_BACKEND_HOST", default_value_t = String::from("localhost"))]
    host: String,
    #[arg(long, env = "SORTLAB_BACKEND_PORT", default_value_t = 8000)]
    port: u16,
    #[arg(skip)]
    seed_data: Option<SeedData>,
    #[arg(long, env = "SORTLAB_SEED_DATA_PATH")]
    seed_data_path: Option<Utf8PathBuf>,
    #[command(flatten)]
    #[serde(default)]
    equipment: EquipmentConfig,
}

impl Config {
    #[must_use]
    pub fn is_dev(&self) -> bool {
        self.dev
    }

    /// # Errors
    pub fn read_secrets(&mut self) -> anyhow::Result<()> {
        let Self {
            secrets_dir,
            db_root_user,
            db_root_password,
            db_login_user_password,
            db_name,
            frontend_token,
            seed_data,
            seed_data_path,
            ..
        } = self;

        let Some(secrets_dir) = secrets_dir else {
            return Ok(());
        };

        let read_secret = |name: &str| {
            fs::read_to_string(secrets_dir.join(name))
                .map(|s| s.trim().to_string())
                .context(format!("failed to read secret {name}"))
        };

        *db_root_user = read_secret("db_root_user")?;
        *db_root_password = read_secret("db_root_password")?;
        *db_login_user_password = read_secret("db_login_user_password")?;
        *frontend_token = read_secret("frontend_token")?;
        *db_name = read_secret("db_name")?;

        if secrets_dir.join("seed_data").exists() {
            *seed_data = serde_json::from_str(&read_secret("seed_data")?)?;
            *seed_data_path = None;
        }

        Ok(())
    }

    #[must_use]
    pub fn app_address(&self) -> String {
        let Self {
            host: app_host,
            port: app_port,
            ..
        } = self;

        format!("{app_host}:{app_port}")
    }

    #[must_use]
    pub fn db_login_user_password(&self) -> &str {
        &self.db_login_user_password
    }

    fn db_url(&self, root: bool) -> String {
        let Self {
            db_root_user,
            db_root_password,
            db_login_user_password,
            db_host,
            db_port,
            db_name,
            ..
        } = self;

        let base = "postgres://";
        let db_spec = format!("{db_host}:{db_port}/{db_name}");

        if root {
            format!("{base}{db_root_user}:{db_root_password}@{db_spec}")
        } else {
            format!("{base}{LOGIN_USER}:{db_login_user_password}@{db_spec}")
        }
    }

    #[must_use]
    pub fn db_root_url(&self) -> String {
        self.db_url(true)
    }

    #[must_use]
    pub fn db_login_url(&self) -> String {
        self.db_url(false)
    }

    #[must_use]
    pub fn frontend_token(&self) -> &str {
        &self.frontend_token
    }

    #[must_use]
    pub fn equipment(&self) -> &EquipmentConfig {
        &self.equipment
    }

    /// # Errors
    pub fn seed_data(&self) -> anyhow::Result<SeedData> {
        let Self {
            seed_data,
            seed_data_path,
            ..
        } = self;

        match (seed_data, seed_data_path) {
            (Some(seed_data), None) => Ok(seed_data.clone()),
            (None, Some(seed_data_path)) => {
                let contents = fs::read_to_string(seed_data_path)
                    .context(format!("failed to read {seed_data_path}"))?;

                if seed_data_path.extension() == Some("toml") {
                    Ok(toml::from_str(&contents)?)
                } else {
                    Ok(serde_json::from_str(&contents)?)
                }
            }
            (Some(_), Some(_)) => bail!("`seed_data` and `seed_data_path` are mutually exclusive"),
            (None, None) => {
                tracing::warn!("neither `seed_data` nor `seed_data_path` was supplied");
                Ok(SeedData::default())
            }
        }
    }
}

/// Where the sorting line controller listens and how it is driven
#[derive(Args, serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct EquipmentConfig {
    #[arg(id = "equipment_host", long = "equipment-host", env = "SORTLAB_EQUIPMENT_HOST", default_value_t = String::from("localhost"))]
    host: String,
    #[arg(id = "equipment_port", long = "equipment-port", env = "SORTLAB_EQUIPMENT_PORT", default_value_t = 4840)]
    port: u16,
    #[arg(id = "equipment_path", long = "equipment-path", env = "SORTLAB_EQUIPMENT_PATH", default_value_t = String::from("/RPC2"))]
    path: String,
    #[arg(id = "equipment_timeout_secs", long = "equipment-timeout-secs", env = "SORTLAB_EQUIPMENT_TIMEOUT_SECS", default_value_t = 10)]
    timeout_secs: u64,
    #[arg(long, env = "SORTLAB_ROBOT_JOB_METHOD", default_value_t = String::from("set_ur_job"))]
    robot_job_method: String,
    #[arg(long, env = "SORTLAB_CONVEYOR_JOB_METHOD", default_value_t = String::from("set_plc_job"))]
    conveyor_job_method: String,
    #[arg(long, env = "SORTLAB_CLEAR_DATA_METHOD", default_value_t = String::from("clear_sorting_data"))]
    clear_data_method: String,
    #[arg(long, env = "SORTLAB_CLEAR_RAMP_METHOD", default_value_t = String::from("clear_ur_sorting_ramp"))]
    clear_ramp_method: String,
    #[arg(id = "equipment_failure_policy", long = "equipment-failure-policy", env = "SORTLAB_EQUIPMENT_FAILURE_POLICY", value_enum, default_value_t)]
    failure_policy: FailurePolicy,
    #[command(flatten)]
    job_codes: JobCodes,
}

impl Default for EquipmentConfig {
    fn default() -> Self {
        let SequencerSettings {
            robot_job_method,
            conveyor_job_method,
            clear_data_method,
            clear_ramp_method,
            job_codes,
            failure_policy,
        } = SequencerSettings::default();

        Self {
            host: "localhost".to_string(),
            port: 4840,
            path: "/RPC2".to_string(),
            timeout_secs: 10,
            robot_job_method,
            conveyor_job_method,
            clear_data_method,
            clear_ramp_method,
            failure_policy,
            job_codes,
        }
    }
}

impl EquipmentConfig {
    /// # Errors
    pub fn endpoint(&self) -> anyhow::Result<Url> {
        let Self {
            host, port, path, ..
        } = self;

        let base = Url::parse(&format!("http://{host}:{port}"))
            .context(format!("invalid equipment address {host}:{port}"))?;

        Ok(base.join(path)?)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    #[must_use]
    pub fn sequencer_settings(&self) -> SequencerSettings {
        let Self {
            robot_job_method,
            conveyor_job_method,
            clear_data_method,
            clear_ramp_method,
            failure_policy,
            job_codes,
            ..
        } = self;

        SequencerSettings {
            robot_job_method: robot_job_method.clone(),
            conveyor_job_method: conveyor_job_method.clone(),
            clear_data_method: clear_data_method.clone(),
            clear_ramp_method: clear_ramp_method.clone(),
            job_codes: *job_codes,
            failure_policy: *failure_policy,
        }
    }
}

#[derive(Parser)]
#[command(version)]
pub struct Cli {
    #[command(flatten)]
    pub config: Config,
    #[arg(long, env = "SORTLAB_LOG_DIR")]
    pub log_dir: Option<Utf8PathBuf>,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    use super::{Config, EquipmentConfig};
    use crate::equipment::sequencer::{FailurePolicy, SequencerSettings};

    #[test]
    fn equipment_defaults() {
        let equipment = EquipmentConfig::default();

        assert_eq!(
            equipment.endpoint().unwrap().as_str(),
            "http://localhost:4840/RPC2"
        );
        assert_eq!(equipment.timeout(), Duration::from_secs(10));
        assert_eq!(equipment.sequencer_settings(), SequencerSettings::default());
    }

    #[test]
    fn deserialize_config_with_partial_equipment() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "db_root_user": "postgres",
            "db_root_password": "",
            "db_login_user_password": "pw",
            "db_host": "db",
            "db_port": 5432,
            "db_name": "sortlab",
            "frontend_token": "token",
            "host": "0.0.0.0",
            "port": 8000,
            "equipment": {
                "host": "172.18.0.60",
                "failure_policy": "continue",
                "job_codes": {"stop_conveyor": 9}
            }
        }))
        .unwrap();

        assert!(!config.is_dev());
        assert_eq!(config.db_login_url(), "postgres://login_user:pw@db:5432/sortlab");

        let equipment = config.equipment();
        assert_eq!(
            equipment.endpoint().unwrap().as_str(),
            "http://172.18.0.60:4840/RPC2"
        );

        let settings = equipment.sequencer_settings();
        assert_eq!(settings.failure_policy, FailurePolicy::Continue);
        assert_eq!(settings.job_codes.stop_conveyor, 9);
        assert_eq!(settings.job_codes.start_conveyor, 2101);
    }

    #[test]
    fn missing_seed_data_is_empty() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "db_root_user": "", "db_root_password": "", "db_login_user_password": "",
            "db_host": "", "db_port": 5432, "db_name": "", "frontend_token": "",
            "host": "", "port": 8000
        }))
        .unwrap();

        let seed_data = config.seed_data().unwrap();
        assert!(seed_data.sample_types.is_empty());
        assert!(seed_data.racks.is_empty());
    }
}
