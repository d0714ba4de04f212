pub mod server;

// Internal "interpreter" for `Action`.
// The match lives in `run` so this file only grows by one variant per action.
mod run;

/// What the binary was asked to do, built by `cli::dispatch` from the parsed flags.
#[derive(Debug)]
pub enum Action {
    /// Serve the auth API and run the session sweeper.
    Server(server::Args),
}

impl Action {
    // Call sites only see `action.execute().await`; new variants go in `run::execute`.
    /// Execute the action.
    /// # Errors
    /// Returns an error if the action fails.
    pub async fn execute(self) -> anyhow::Result<()> {
        run::execute(self).await
    }
}
