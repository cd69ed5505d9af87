use std::fmt;
use std::path::PathBuf;

use sandbox::OutputTag;
use serde::{Deserialize, Serialize};

/// Caller-assigned correlation id. Uniqueness is the caller's concern.
pub type JobId = i64;

pub const EXIT_SUCCESS: i32 = 0;
/// The build failed, including the `BUILD FAILED` marker override.
pub const EXIT_FAILURE: i32 = 1;
/// Rejected: busy, invalid request, or sandbox root not installed.
pub const EXIT_REJECTED: i32 = sandbox::BUSY_EXIT_CODE;

// ---------------------------------------------------------------------------
// Requests (caller → runner)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Request {
    RunBuild {
        id: JobId,
        #[serde(flatten)]
        spec: BuildSpec,
    },
    CleanWorkspace {
        id: JobId,
        #[serde(flatten)]
        spec: CleanSpec,
    },
    Cancel {
        id: JobId,
        target: JobId,
    },
}

impl Request {
    pub fn id(&self) -> JobId {
        match self {
            Self::RunBuild { id, .. } | Self::CleanWorkspace { id, .. } | Self::Cancel { id, .. } => {
                *id
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSpec {
    /// Arguments passed to the Gradle wrapper.
    pub args: Vec<String>,
    pub project_path: PathBuf,
    /// Build directory relative to `project_path`, e.g. `android/build`.
    pub build_dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanSpec {
    pub project_path: PathBuf,
    pub build_dir: String,
    /// Delete even when `workspace.clear_after_build` is off.
    #[serde(default)]
    pub force_clean: bool,
}

/// Work item consumed by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobKind {
    RunBuild(BuildSpec),
    CleanWorkspace(CleanSpec),
}

impl JobKind {
    /// Workspace cleanup is never matched by cancellation.
    pub fn is_cancelable(&self) -> bool {
        matches!(self, Self::RunBuild(_))
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunBuild(_) => f.write_str("run-build"),
            Self::CleanWorkspace(_) => f.write_str("clean-workspace"),
        }
    }
}

// ---------------------------------------------------------------------------
// Responses (runner → caller)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineTag {
    Info,
    Stdout,
    Stderr,
}

impl From<OutputTag> for LineTag {
    fn from(tag: OutputTag) -> Self {
        match tag {
            OutputTag::Info => Self::Info,
            OutputTag::Stdout => Self::Stdout,
            OutputTag::Stderr => Self::Stderr,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Response {
    OutputLine {
        id: JobId,
        tag: LineTag,
        text: String,
    },
    /// Terminal message: exactly one per RunBuild/CleanWorkspace request.
    Result {
        id: JobId,
        #[serde(rename = "exitCode")]
        exit_code: i32,
    },
}

impl Response {
    pub fn id(&self) -> JobId {
        match self {
            Self::OutputLine { id, .. } | Self::Result { id, .. } => *id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_build_request() {
        let json = r#"{
            "kind": "runBuild",
            "id": 1,
            "args": ["tasks"],
            "projectPath": "/ext/proj",
            "buildDir": "android/build"
        }"#;
        let request: Request = serde_json::from_str(json).unwrap();
        assert_eq!(
            request,
            Request::RunBuild {
                id: 1,
                spec: BuildSpec {
                    args: vec!["tasks".into()],
                    project_path: PathBuf::from("/ext/proj"),
                    build_dir: "android/build".into(),
                },
            }
        );
        assert_eq!(request.id(), 1);
    }

    #[test]
    fn parse_clean_request_defaults_force_clean() {
        let json = r#"{"kind":"cleanWorkspace","id":7,"projectPath":"/p","buildDir":"b"}"#;
        let request: Request = serde_json::from_str(json).unwrap();
        match request {
            Request::CleanWorkspace { id, spec } => {
                assert_eq!(id, 7);
                assert!(!spec.force_clean);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn parse_cancel_request() {
        let json = r#"{"kind":"cancel","id":3,"target":2}"#;
        let request: Request = serde_json::from_str(json).unwrap();
        assert_eq!(request, Request::Cancel { id: 3, target: 2 });
    }

    #[test]
    fn incomplete_request_is_rejected() {
        let json = r#"{"kind":"runBuild","id":1,"args":["tasks"]}"#;
        assert!(serde_json::from_str::<Request>(json).is_err());
    }

    #[test]
    fn serialize_responses() {
        let line = Response::OutputLine {
            id: 1,
            tag: LineTag::Stdout,
            text: "BUILD SUCCESSFUL".into(),
        };
        let value = serde_json::to_value(&line).unwrap();
        assert_eq!(value["kind"], "outputLine");
        assert_eq!(value["tag"], "stdout");
        assert_eq!(value["text"], "BUILD SUCCESSFUL");

        let result = Response::Result {
            id: 1,
            exit_code: 0,
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["kind"], "result");
        assert_eq!(value["exitCode"], 0);
        assert_eq!(result.id(), 1);
    }

    #[test]
    fn only_builds_are_cancelable() {
        let build = JobKind::RunBuild(BuildSpec {
            args: vec![],
            project_path: PathBuf::from("/p"),
            build_dir: "b".into(),
        });
        let clean = JobKind::CleanWorkspace(CleanSpec {
            project_path: PathBuf::from("/p"),
            build_dir: "b".into(),
            force_clean: true,
        });
        assert!(build.is_cancelable());
        assert!(!clean.is_cancelable());
    }
}
