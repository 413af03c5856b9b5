//! Release detection: polls upstream sources and turns new release content
//! into release rows plus pending deliveries.

pub mod github;
pub mod poller;

pub use github::GitHubReleaseSource;
pub use poller::{PollSummary, ReleasePoller, RepoOutcome};
