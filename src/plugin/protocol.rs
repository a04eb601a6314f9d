// src/plugin/protocol.rs

//! JSON-lines frames exchanged with a plugin after the handshake.

use serde::{Deserialize, Serialize};

use crate::domain::{JobDescriptor, JobOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    GetJobs,
    Execute,
    Shutdown,
}

/// Host → plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: Method,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,
}

/// Plugin → host. Exactly one of the optional fields is expected per frame.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jobs: Option<Vec<JobDescriptor>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Terminal frame of an `execute` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecResult {
    Success,
    Failure {
        #[serde(default)]
        message: Option<String>,
    },
}

impl From<ExecResult> for JobOutcome {
    fn from(result: ExecResult) -> Self {
        match result {
            ExecResult::Success => JobOutcome::Success,
            ExecResult::Failure { message } => {
                JobOutcome::Failure(message.unwrap_or_else(|| "job failed".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_match_wire_format() {
        let get = Request {
            id: 1,
            method: Method::GetJobs,
            job: None,
        };
        assert_eq!(
            serde_json::to_string(&get).unwrap(),
            r#"{"id":1,"method":"get_jobs"}"#
        );

        let exec = Request {
            id: 2,
            method: Method::Execute,
            job: Some("build".into()),
        };
        assert_eq!(
            serde_json::to_string(&exec).unwrap(),
            r#"{"id":2,"method":"execute","job":"build"}"#
        );
    }

    #[test]
    fn decodes_plugin_frames() {
        let jobs: Response = serde_json::from_str(
            r#"{"id":1,"jobs":[{"name":"build"},{"name":"test","depends_on":["build"],"priority":2,"independent":true}]}"#,
        )
        .unwrap();
        let jobs = jobs.jobs.unwrap();
        assert_eq!(jobs[1].depends_on, vec!["build"]);
        assert_eq!(jobs[1].priority, Some(2));
        assert!(jobs[1].independent);

        let failure: Response =
            serde_json::from_str(r#"{"id":3,"result":{"status":"failure","message":"exit 2"}}"#)
                .unwrap();
        assert_eq!(
            JobOutcome::from(failure.result.unwrap()),
            JobOutcome::Failure("exit 2".into())
        );

        let bare: Response =
            serde_json::from_str(r#"{"id":3,"result":{"status":"failure"}}"#).unwrap();
        assert_eq!(
            JobOutcome::from(bare.result.unwrap()),
            JobOutcome::Failure("job failed".into())
        );
    }
}
