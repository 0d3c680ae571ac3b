//! Wire format between the supervisor and the worker subprocess: one JSON
//! object per line in each direction.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetParams {
    pub max_bytes: i64,
    pub min_bytes: i64,
    /// Seconds; rows older than this are candidates regardless of size.
    pub max_age_secs: Option<i64>,
    /// Seconds; rows younger than this are never candidates.
    pub min_age_secs: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckTierCommand {
    pub id: u64,
    pub camera_identifier: String,
    pub tier_id: i64,
    pub category: String,
    pub subcategories: Vec<String>,
    pub throttle_period_secs: i64,
    /// Budgets applied to individual files; `None` disables the files pass.
    pub files: Option<BudgetParams>,
    /// Budgets applied to whole recordings; `None` disables the events pass.
    pub events: Option<BudgetParams>,
}

impl CheckTierCommand {
    /// Throttle bucket: one per camera + tier + category + first
    /// subcategory.
    pub fn throttle_key(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.camera_identifier,
            self.tier_id,
            self.category,
            self.subcategories.first().map(String::as_str).unwrap_or("")
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    CheckTier(CheckTierCommand),
    MoveFile { id: u64, src: String, dst: String },
    DeleteFile { id: u64, src: String },
}

impl Command {
    pub fn id(&self) -> u64 {
        match self {
            Command::CheckTier(cmd) => cmd.id,
            Command::MoveFile { id, .. } | Command::DeleteFile { id, .. } => *id,
        }
    }
}

/// A file selected for moving to the next tier (or deletion at the last).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveCandidate {
    /// Owning recording, when selected by the events pass.
    pub recording_id: Option<i64>,
    pub file_id: i64,
    pub path: String,
    pub tier_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default)]
    pub files_to_move: Vec<MoveCandidate>,
    #[serde(default)]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_round_trips_as_json_line() {
        let cmd = Command::CheckTier(CheckTierCommand {
            id: 7,
            camera_identifier: "cam_1".into(),
            tier_id: 0,
            category: "recorder".into(),
            subcategories: vec!["segments".into()],
            throttle_period_secs: 60,
            files: Some(BudgetParams {
                max_bytes: 1_000_000,
                min_bytes: 0,
                max_age_secs: None,
                min_age_secs: None,
            }),
            events: None,
        });
        let line = serde_json::to_string(&cmd).unwrap();
        assert!(!line.contains('\n'));
        let parsed: Command = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.id(), 7);
        match parsed {
            Command::CheckTier(parsed) => {
                assert_eq!(parsed.throttle_key(), "cam_1_0_recorder_segments");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn response_defaults_tolerate_sparse_json() {
        let response: Response = serde_json::from_str("{\"id\": 3}").unwrap();
        assert_eq!(response.id, 3);
        assert!(response.files_to_move.is_empty());
        assert!(response.error.is_none());
    }
}
