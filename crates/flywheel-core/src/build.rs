//! Build identity.

use serde::{Deserialize, Serialize};

/// A build as seen by the persistence layer.
///
/// A build belongs either to a pipeline (pipeline builds) or directly to a
/// team (one-off builds); that ownership decides which physical event
/// partition its log lives in, for the build's entire lifetime.
pub trait Build: Send + Sync {
    fn id(&self) -> i32;
    fn pipeline_id(&self) -> Option<i32>;
    fn team_id(&self) -> i32;
}

/// A plain, cloneable [`Build`] implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildRef {
    pub id: i32,
    pub pipeline_id: Option<i32>,
    pub team_id: i32,
}

impl BuildRef {
    /// A build attached to a pipeline.
    pub fn pipeline(id: i32, pipeline_id: i32, team_id: i32) -> Self {
        Self {
            id,
            pipeline_id: Some(pipeline_id),
            team_id,
        }
    }

    /// A one-off build owned directly by a team.
    pub fn one_off(id: i32, team_id: i32) -> Self {
        Self {
            id,
            pipeline_id: None,
            team_id,
        }
    }
}

impl Build for BuildRef {
    fn id(&self) -> i32 {
        self.id
    }

    fn pipeline_id(&self) -> Option<i32> {
        self.pipeline_id
    }

    fn team_id(&self) -> i32 {
        self.team_id
    }
}

/// Terminal and non-terminal build states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Started,
    Succeeded,
    Failed,
    Errored,
    Aborted,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BuildStatus::Started)
    }
}
