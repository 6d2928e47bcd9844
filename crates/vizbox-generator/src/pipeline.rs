//! Background generation task.

use crate::generate::{extract_html, CodeGenerator, GenerateError};
use crate::job::Job;
use crate::state::{Phase, PhaseCell};
use std::path::PathBuf;
use std::sync::Arc;

/// Builds the generator once the job has been read.
pub type Connect = Box<dyn FnOnce(&Job) -> Result<Arc<dyn CodeGenerator>, GenerateError> + Send>;

/// Run one generation, publishing every phase through `cell`.
///
/// Never returns an error: failures end up in the cell for `/status`.
pub async fn run(cell: PhaseCell, job_path: PathBuf, connect: Connect) {
    match generate(&cell, job_path, connect).await {
        Ok(artifact) => {
            tracing::info!(bytes = artifact.len(), "Artifact ready");
            cell.complete(artifact);
        }
        Err(e) => cell.fail(e.to_string()),
    }
}

async fn generate(cell: &PhaseCell, job_path: PathBuf, connect: Connect) -> Result<String, GenerateError> {
    cell.advance(Phase::ParsingRequest);
    let job = Job::load(&job_path).await?;
    tracing::info!(model = %job.model, max_tokens = job.max_tokens, "Job loaded");

    cell.advance(Phase::CreatingClient);
    let generator = connect(&job)?;

    cell.advance(Phase::CallingApi);
    let answer = generator.generate(&job).await?;

    cell.advance(Phase::ParsingResponse);
    extract_html(&answer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct Canned(Result<String, ()>);

    #[async_trait]
    impl CodeGenerator for Canned {
        async fn generate(&self, _job: &Job) -> Result<String, GenerateError> {
            self.0.clone().map_err(|_| GenerateError::Api {
                status: 500,
                message: "upstream down".into(),
            })
        }
    }

    fn job_file(contents: &str) -> PathBuf {
        static NEXT: AtomicU32 = AtomicU32::new(0);
        let dir = std::env::temp_dir().join(format!("vizbox-generator-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("job-{}.json", NEXT.fetch_add(1, Ordering::SeqCst)));
        std::fs::write(&path, contents).unwrap();
        path
    }

    const JOB: &str = r#"{"version":1,"model":"m","max_tokens":64,"request":{"prompt":"bars"}}"#;

    fn canned(answer: Result<String, ()>) -> Connect {
        Box::new(move |_job: &Job| Ok(Arc::new(Canned(answer)) as Arc<dyn CodeGenerator>))
    }

    #[tokio::test]
    async fn test_success_reaches_ready() {
        let (cell, rx) = PhaseCell::new();
        let answer = "```html\n<html><body>ok</body></html>\n```".to_string();
        run(cell, job_file(JOB), canned(Ok(answer))).await;

        let state = rx.borrow();
        assert_eq!(state.phase, Phase::Ready);
        assert_eq!(state.artifact.as_deref(), Some("<html><body>ok</body></html>"));
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn test_phases_are_observed_in_order() {
        let (cell, mut rx) = PhaseCell::new();
        let seen = Arc::new(Mutex::new(vec![rx.borrow().phase]));
        let sink = Arc::clone(&seen);
        let watcher = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let phase = rx.borrow_and_update().phase;
                sink.lock().unwrap().push(phase);
            }
        });

        let connect: Connect = Box::new(|_job: &Job| {
            Ok(Arc::new(Canned(Ok("<html></html>".into()))) as Arc<dyn CodeGenerator>)
        });
        run(cell, job_file(JOB), connect).await;
        watcher.await.unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.first(), Some(&Phase::Initializing));
        assert_eq!(seen.last(), Some(&Phase::Ready));
        let mut deduped = seen.clone();
        deduped.dedup();
        assert_eq!(deduped, seen);
    }

    #[tokio::test]
    async fn test_api_failure_reaches_error() {
        let (cell, rx) = PhaseCell::new();
        run(cell, job_file(JOB), canned(Err(()))).await;

        let state = rx.borrow();
        assert_eq!(state.phase, Phase::Error);
        assert_eq!(state.error.as_deref(), Some("API returned 500: upstream down"));
    }

    #[tokio::test]
    async fn test_missing_key_fails_while_creating_client() {
        let (cell, rx) = PhaseCell::new();
        let connect: Connect = Box::new(|_job: &Job| Err(GenerateError::MissingApiKey));
        run(cell, job_file(JOB), connect).await;
        assert_eq!(rx.borrow().error.as_deref(), Some("ANTHROPIC_API_KEY is not set"));
    }

    #[tokio::test]
    async fn test_non_html_answer_fails() {
        let (cell, rx) = PhaseCell::new();
        run(cell, job_file(JOB), canned(Ok("no chart, sorry".into()))).await;
        assert_eq!(rx.borrow().phase, Phase::Error);
    }

    #[tokio::test]
    async fn test_unreadable_job_fails() {
        let (cell, rx) = PhaseCell::new();
        run(cell, PathBuf::from("/nonexistent/job.json"), canned(Ok(String::new()))).await;
        let state = rx.borrow();
        assert_eq!(state.phase, Phase::Error);
        assert!(state.error.as_deref().unwrap().starts_with("invalid job"));
    }
}
