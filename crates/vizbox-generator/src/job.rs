//! Job file written by the orchestrator at the sandbox entrypoint.

use crate::generate::GenerateError;
use serde::Deserialize;
use std::path::Path;

/// Highest job format version this binary understands.
pub const SUPPORTED_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Job {
    pub version: u32,
    pub model: String,
    pub max_tokens: u32,
    /// Caller payload, passed through untouched.
    pub request: serde_json::Value,
}

impl Job {
    pub async fn load(path: &Path) -> Result<Self, GenerateError> {
        let raw = tokio::fs::read(path).await.map_err(|e| {
            GenerateError::InvalidJob(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &[u8]) -> Result<Self, GenerateError> {
        let job: Job = serde_json::from_slice(raw)
            .map_err(|e| GenerateError::InvalidJob(e.to_string()))?;
        if job.version == 0 || job.version > SUPPORTED_VERSION {
            return Err(GenerateError::InvalidJob(format!(
                "unsupported job version {}",
                job.version
            )));
        }
        if job.request.is_null() {
            return Err(GenerateError::InvalidJob("request is empty".into()));
        }
        Ok(job)
    }

    /// User message sent to the model.
    ///
    /// A top-level `prompt` string is lifted out as the instruction; anything
    /// else in the request is attached as JSON context.
    pub fn prompt(&self) -> String {
        let instruction = self
            .request
            .get("prompt")
            .and_then(|p| p.as_str())
            .unwrap_or("Create the most useful chart for the data below.");

        let context = match &self.request {
            serde_json::Value::Object(map) => {
                let rest: serde_json::Map<_, _> = map
                    .iter()
                    .filter(|(key, _)| key.as_str() != "prompt")
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                (!rest.is_empty()).then(|| serde_json::Value::Object(rest))
            }
            other => Some(other.clone()),
        };

        match context.and_then(|c| serde_json::to_string_pretty(&c).ok()) {
            Some(json) => format!("{instruction}\n\nRequest data:\n```json\n{json}\n```"),
            None => instruction.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job(request: serde_json::Value) -> Job {
        Job {
            version: 1,
            model: "m".into(),
            max_tokens: 100,
            request,
        }
    }

    #[test]
    fn test_parse_orchestrator_job() {
        let raw = br#"{
  "version": 1,
  "model": "claude-3-5-sonnet-latest",
  "max_tokens": 8192,
  "request": {"prompt": "bars", "data": [1, 2]}
}
"#;
        let job = Job::parse(raw).unwrap();
        assert_eq!(job.model, "claude-3-5-sonnet-latest");
        assert_eq!(job.max_tokens, 8192);
        assert_eq!(job.request["data"], json!([1, 2]));
    }

    #[test]
    fn test_rejects_bad_jobs() {
        assert!(matches!(Job::parse(b"not json"), Err(GenerateError::InvalidJob(_))));
        assert!(Job::parse(br#"{"version":2,"model":"m","max_tokens":1,"request":{}}"#).is_err());
        assert!(Job::parse(br#"{"version":1,"model":"m","max_tokens":1,"request":null}"#).is_err());
    }

    #[test]
    fn test_prompt_lifts_instruction() {
        let prompt = job(json!({"prompt": "pie of shares", "data": {"a": 1}})).prompt();
        assert!(prompt.starts_with("pie of shares"));
        assert!(prompt.contains("\"a\": 1"));
        assert!(!prompt.contains("\"prompt\""));
    }

    #[test]
    fn test_prompt_only_instruction() {
        assert_eq!(job(json!({"prompt": "just this"})).prompt(), "just this");
    }

    #[test]
    fn test_prompt_without_instruction() {
        let prompt = job(json!([1, 2, 3])).prompt();
        assert!(prompt.starts_with("Create the most useful chart"));
        assert!(prompt.contains("1,"));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = Job::load(Path::new("/nonexistent/generator.json"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot read"));
    }
}
