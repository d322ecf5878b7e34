use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use valuable::Valuable;

use super::{EquipmentLink, Error, RpcValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Valuable, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Controller {
    Robot,
    Conveyor,
}

/// The key under which a step's reply is reported to callers
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Valuable, strum::Display,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ReplyRole {
    PlcResponse,
    UrResponse,
    DataResponse,
    RampResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Valuable, strum::Display)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum Operation {
    StartSorting,
    StopSorting,
    ResetDemo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Valuable, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StepName {
    StartConveyor,
    StopConveyor,
    StopRobotSorting,
    ClearSortingData,
    ClearSortingRamp,
}

/// Opaque job codes agreed upon with the controller firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::Args)]
#[serde(default)]
pub struct JobCodes {
    #[arg(long = "job-start-robot-sorting", env = "SORTLAB_JOB_START_ROBOT_SORTING", default_value_t = 2301)]
    pub start_robot_sorting: i32,
    #[arg(long = "job-stop-robot-sorting", env = "SORTLAB_JOB_STOP_ROBOT_SORTING", default_value_t = 2302)]
    pub stop_robot_sorting: i32,
    #[arg(long = "job-start-conveyor", env = "SORTLAB_JOB_START_CONVEYOR", default_value_t = 2101)]
    pub start_conveyor: i32,
    #[arg(long = "job-stop-conveyor", env = "SORTLAB_JOB_STOP_CONVEYOR", default_value_t = 2102)]
    pub stop_conveyor: i32,
}

impl Default for JobCodes {
    fn default() -> Self {
        Self {
            start_robot_sorting: 2301,
            stop_robot_sorting: 2302,
            start_conveyor: 2101,
            stop_conveyor: 2102,
        }
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, Valuable, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop at the first failed step and leave the rest unattempted
    #[default]
    Abort,
    /// Attempt every step and report all failures
    Continue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencerSettings {
    pub robot_job_method: String,
    pub conveyor_job_method: String,
    pub clear_data_method: String,
    pub clear_ramp_method: String,
    pub job_codes: JobCodes,
    pub failure_policy: FailurePolicy,
}

impl Default for SequencerSettings {
    fn default() -> Self {
        Self {
            robot_job_method: "set_ur_job".to_string(),
            conveyor_job_method: "set_plc_job".to_string(),
            clear_data_method: "clear_sorting_data".to_string(),
            clear_ramp_method: "clear_ur_sorting_ramp".to_string(),
            job_codes: JobCodes::default(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl SequencerSettings {
    fn job_method(&self, controller: Controller) -> &str {
        match controller {
            Controller::Robot => &self.robot_job_method,
            Controller::Conveyor => &self.conveyor_job_method,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub name: StepName,
    pub role: ReplyRole,
    pub method: String,
    pub args: Vec<RpcValue>,
}

fn clear_step(name: StepName, role: ReplyRole, method: &str) -> Step {
    Step {
        name,
        role,
        method: method.to_string(),
        args: vec![],
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Valuable)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum StepStatus {
    Succeeded { reply: RpcValue },
    Failed { error: Error },
    NotAttempted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Valuable)]
pub struct StepOutcome {
    /// 1-based position of the step within its operation
    pub index: usize,
    pub step: StepName,
    pub role: ReplyRole,
    pub method: String,
    #[serde(flatten)]
    pub status: StepStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Valuable)]
pub struct SequenceReport {
    pub operation: Operation,
    pub steps: Vec<StepOutcome>,
}

impl SequenceReport {
    #[must_use]
    pub fn reply(&self, role: ReplyRole) -> Option<&RpcValue> {
        self.steps.iter().find_map(|outcome| match &outcome.status {
            StepStatus::Succeeded { reply } if outcome.role == role => Some(reply),
            _ => None,
        })
    }

    #[must_use]
    pub fn into_replies(self) -> BTreeMap<ReplyRole, RpcValue> {
        self.steps
            .into_iter()
            .filter_map(|outcome| match outcome.status {
                StepStatus::Succeeded { reply } => Some((outcome.role, reply)),
                _ => None,
            })
            .collect()
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Serialize, Valuable)]
#[error("{operation} failed at step {index} ({step}): {cause}")]
pub struct SequenceFailure {
    pub operation: Operation,
    pub index: usize,
    pub step: StepName,
    pub cause: Error,
    pub report: SequenceReport,
}

pub type SequenceResult<T> = std::result::Result<T, SequenceFailure>;

/// Drives the robot and conveyor controllers through start, stop and reset.
///
/// Operations are not atomic across controllers. A failure part-way through leaves the line in whatever state the
/// succeeded steps put it in, and the returned report says exactly which steps those were.
#[derive(Debug, Clone)]
pub struct SortingSequencer<L> {
    link: L,
    settings: SequencerSettings,
}

impl<L: EquipmentLink + Sync> SortingSequencer<L> {
    pub fn new(link: L, settings: SequencerSettings) -> Self {
        Self { link, settings }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    fn job_step(&self, name: StepName, role: ReplyRole, controller: Controller, code: i32) -> Step {
        Step {
            name,
            role,
            method: self.settings.job_method(controller).to_string(),
            args: vec![RpcValue::from(code)],
        }
    }

    /// The ordered remote calls that make up `operation`
    #[must_use]
    pub fn steps(&self, operation: Operation) -> Vec<Step> {
        use ReplyRole::{DataResponse, PlcResponse, RampResponse, UrResponse};
        use StepName::{ClearSortingData, ClearSortingRamp, StartConveyor, StopConveyor, StopRobotSorting};

        let codes = &self.settings.job_codes;

        match operation {
            Operation::StartSorting => vec![self.job_step(
                StartConveyor,
                PlcResponse,
                Controller::Conveyor,
                codes.start_conveyor,
            )],
            Operation::StopSorting => vec![
                self.job_step(StopConveyor, PlcResponse, Controller::Conveyor, codes.stop_conveyor),
                self.job_step(
                    StopRobotSorting,
                    UrResponse,
                    Controller::Robot,
                    codes.stop_robot_sorting,
                ),
            ],
            Operation::ResetDemo => vec![
                self.job_step(
                    StopRobotSorting,
                    UrResponse,
                    Controller::Robot,
                    codes.stop_robot_sorting,
                ),
                self.job_step(StopConveyor, PlcResponse, Controller::Conveyor, codes.stop_conveyor),
                clear_step(ClearSortingData, DataResponse, &self.settings.clear_data_method),
                clear_step(ClearSortingRamp, RampResponse, &self.settings.clear_ramp_method),
            ],
        }
    }

    /// Run every step of `operation` in order, recording each outcome before moving on.
    ///
    /// # Errors
    /// Returns the first failed step together with the full report when any step fails.
    pub async fn run(&self, operation: Operation) -> SequenceResult<SequenceReport> {
        let steps = self.steps(operation);
        let abort_on_failure = self.settings.failure_policy == FailurePolicy::Abort;

        let mut outcomes = Vec::with_capacity(steps.len());
        let mut first_failure: Option<(usize, StepName, Error)> = None;

        for (i, Step { name, role, method, args }) in steps.into_iter().enumerate() {
            let index = i + 1;

            let status = if abort_on_failure && first_failure.is_some() {
                StepStatus::NotAttempted
            } else {
                match self.link.call(&method, &args).await {
                    Ok(reply) => {
                        tracing::info!(%operation, index, step = %name, %method, "equipment step succeeded");
                        StepStatus::Succeeded { reply }
                    }
                    Err(error) => {
                        tracing::error!(%operation, index, step = %name, error = error.as_value(), "equipment step failed");
                        if first_failure.is_none() {
                            first_failure = Some((index, name, error.clone()));
                        }
                        StepStatus::Failed { error }
                    }
                }
            };

            outcomes.push(StepOutcome {
                index,
                step: name,
                role,
                method,
                status,
            });
        }

        let report = SequenceReport {
            operation,
            steps: outcomes,
        };

        match first_failure {
            None => Ok(report),
            Some((index, step, cause)) => Err(SequenceFailure {
                operation,
                index,
                step,
                cause,
                report,
            }),
        }
    }

    /// Start the conveyor, returning the controller's raw reply
    ///
    /// # Errors
    pub async fn start_sorting(&self) -> SequenceResult<RpcValue> {
        let mut replies = self.run(Operation::StartSorting).await?.into_replies();

        Ok(replies
            .remove(&ReplyRole::PlcResponse)
            .unwrap_or(RpcValue::Nil))
    }

    /// Stop the conveyor, then the robot
    ///
    /// # Errors
    pub async fn stop_sorting(&self) -> SequenceResult<BTreeMap<ReplyRole, RpcValue>> {
        Ok(self.run(Operation::StopSorting).await?.into_replies())
    }

    /// Stop the robot and the conveyor, then clear the sorting data and the sorting ramp
    ///
    /// # Errors
    pub async fn reset_demo(&self) -> SequenceResult<BTreeMap<ReplyRole, RpcValue>> {
        Ok(self.run(Operation::ResetDemo).await?.into_replies())
    }
}
