//! Platform API layer.
//!
//! `types` models the entities, `http` owns the retrying transport,
//! `api` exposes the capability traits the rest of the bot programs
//! against plus the HTTP-backed client. Tests run against the in-memory
//! fake in `fake`.

pub mod api;
pub mod error;
pub mod http;
pub mod types;

pub use api::{GitLabClient, MergeRequests, Pipelines, Platform, Projects, Repository, Users};
pub use error::{ApiError, MergeRefusal};
pub use http::TransportConfig;
pub use types::{
    AcceptOptions, Approvals, Branch, Commit, CommitSignature, MergeMethod, MergeRequest, MrState,
    Pipeline, PipelineStatus, Project, RebaseStatus, User,
};
