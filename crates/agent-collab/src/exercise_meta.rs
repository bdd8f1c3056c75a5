use async_trait::async_trait;

use crate::error::Result;

/// The exercise-metadata service client, an abstracted collaborator dialed
/// by the `Init` RPC. The core never asks it for exercise
/// *definitions* (those arrive fully formed in `AddExercisesToEnv`/
/// `AddExercisesToLab` request bodies) — it only needs connectivity at
/// `Init` time, to fail fast with `Unavailable` if the service is down.
#[async_trait]
pub trait ExerciseMetadataClient: Send + Sync {
    async fn connect(&self, url: &str, tls: bool) -> Result<()>;
    async fn ping(&self) -> Result<()>;
}
