//! Generator job written into every sandbox.
//!
//! The job is a fixed JSON template with the request payload spliced in.
//! The generator running in the sandbox reads it from [`ENTRYPOINT`].

use crate::config::OrchestratorConfig;
use crate::error::Result;
use bytes::Bytes;

/// Path of the job file inside the sandbox; also the process entrypoint.
pub const ENTRYPOINT: &str = "/app/generator.json";

/// Job format version understood by `vizbox-generator`.
pub const JOB_VERSION: u32 = 1;

const TEMPLATE: &str = r#"{
  "version": __VERSION__,
  "model": __MODEL__,
  "max_tokens": __MAX_TOKENS__,
  "request": __PAYLOAD__
}
"#;

/// Renders generator jobs for a fixed model configuration.
#[derive(Debug, Clone)]
pub struct GeneratorProgram {
    model: String,
    max_tokens: u32,
}

impl GeneratorProgram {
    /// Create a program for `model` with a `max_tokens` limit.
    pub fn new(model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            model: model.into(),
            max_tokens,
        }
    }

    /// Program matching an orchestrator configuration.
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(config.model.clone(), config.max_tokens)
    }

    /// Splice `payload` into the template.
    ///
    /// The payload is substituted last so placeholder-like text inside it is
    /// never rewritten.
    pub fn render(&self, payload: &serde_json::Value) -> Result<Bytes> {
        let model = serde_json::to_string(&self.model)?;
        let payload = serde_json::to_string(payload)?;
        let job = TEMPLATE
            .replace("__VERSION__", &JOB_VERSION.to_string())
            .replace("__MODEL__", &model)
            .replace("__MAX_TOKENS__", &self.max_tokens.to_string())
            .replace("__PAYLOAD__", &payload);
        Ok(Bytes::from(job))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn test_render_is_valid_json() {
        let program = GeneratorProgram::new("test-model", 1024);
        let payload = json!({"prompt": "bar chart of sales", "data": [1, 2, 3]});
        let job: Value = serde_json::from_slice(&program.render(&payload).unwrap()).unwrap();

        assert_eq!(job["version"], json!(JOB_VERSION));
        assert_eq!(job["model"], json!("test-model"));
        assert_eq!(job["max_tokens"], json!(1024));
        assert_eq!(job["request"], payload);
    }

    #[test]
    fn test_payload_placeholders_are_not_rewritten() {
        let program = GeneratorProgram::new("m", 1);
        let payload = json!({"prompt": "__MODEL__ and __MAX_TOKENS__"});
        let job: Value = serde_json::from_slice(&program.render(&payload).unwrap()).unwrap();
        assert_eq!(job["request"]["prompt"], json!("__MODEL__ and __MAX_TOKENS__"));
    }

    #[test]
    fn test_model_is_escaped() {
        let program = GeneratorProgram::new("quote\"model", 1);
        let job: Value = serde_json::from_slice(&program.render(&json!(null)).unwrap()).unwrap();
        assert_eq!(job["model"], json!("quote\"model"));
    }
}
