// Watchflow core: domain model, event bus, collaborator facades
//
// This crate holds everything the engine, storage, and API crates share:
// entity types, the lifecycle event bus, retry/backoff policy, template
// interpolation, and the traits through which external collaborators
// (browser, agent orchestrator, notification providers) are consumed.

pub mod browser;
pub mod bus;
pub mod error;
pub mod model;
pub mod outbound;
pub mod retry;
pub mod template;

pub use browser::{Browser, BrowserError, PageFixture, StubBrowser, Tab};
pub use bus::{EngineEvent, Envelope, EventBus, IntegrationReply};
pub use error::OutboundError;
pub use model::*;
pub use outbound::{
    AgentDispatcher, EmailSender, PullRequestSpec, RecordingEmailSender, RecordingSmsSender,
    RecordingVcsProvider, SmsSender, StubAgentDispatcher, VcsKind, VcsProvider,
};
pub use retry::BackoffPolicy;
