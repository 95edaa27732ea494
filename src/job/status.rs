//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use serde::Deserialize;
use serde::Serialize;

/// Lifecycle of a job inside a build.
///
/// WAITING, RUNNING and WAITING_FOR_DONE are live states; the rest are
/// terminal. UP_TO_DATE is assigned at graph load for jobs whose products
/// already exist; PREREQUISITE_FAILED is kept for status-file compatibility
/// and never produced by the solver.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Waiting,
    Running,
    WaitingForDone,
    Failed,
    Success,
    PrerequisiteFailed,
    UpToDate,
    IgnoredFailure,
}

impl JobStatus {
    pub fn terminating(&self) -> bool {
        matches!(
            self,
            JobStatus::Failed
                | JobStatus::Success
                | JobStatus::IgnoredFailure
                | JobStatus::UpToDate
        )
    }

    pub fn successful(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::IgnoredFailure | JobStatus::UpToDate
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [JobStatus; 8] = [
        JobStatus::Waiting,
        JobStatus::Running,
        JobStatus::WaitingForDone,
        JobStatus::Failed,
        JobStatus::Success,
        JobStatus::PrerequisiteFailed,
        JobStatus::UpToDate,
        JobStatus::IgnoredFailure,
    ];

    #[test]
    fn test_terminating_set() {
        let terminating: Vec<_> = ALL.iter().filter(|s| s.terminating()).collect();
        assert_eq!(
            terminating,
            vec![
                &JobStatus::Failed,
                &JobStatus::Success,
                &JobStatus::UpToDate,
                &JobStatus::IgnoredFailure
            ]
        );
    }

    #[test]
    fn test_successful_implies_terminating() {
        for status in ALL {
            if status.successful() {
                assert!(status.terminating(), "{:?}", status);
            }
        }
        assert!(!JobStatus::Failed.successful());
    }

    #[test]
    fn test_serialized_names() {
        assert_eq!(
            serde_json::to_string(&JobStatus::WaitingForDone).unwrap(),
            "\"WAITING_FOR_DONE\""
        );
        assert_eq!(
            serde_json::to_string(&JobStatus::UpToDate).unwrap(),
            "\"UP_TO_DATE\""
        );
    }
}
