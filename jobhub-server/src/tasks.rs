//! Task bodies bundled with the server.
use async_trait::async_trait;
use jobhub::{
    job::Lane,
    progress::ProgressReporter,
    task::{TaskBody, TaskError},
    JobHub,
};

/// Registers every bundled task body.
pub fn register(hub: JobHub) -> JobHub {
    hub.with_task(Echo)
}

/// Returns its input unchanged. Useful for checking a deployment end to end.
pub struct Echo;

#[async_trait]
impl TaskBody for Echo {
    type Input = serde_json::Value;
    type Output = serde_json::Value;
    const NAME: &'static str = "echo";
    const LANE: Lane = Lane::High;

    async fn run(
        &self,
        input: Self::Input,
        progress: ProgressReporter,
    ) -> Result<Self::Output, TaskError> {
        progress.report(50, "echoing").await;
        progress.report(100, "done").await;
        Ok(input)
    }
}
