pub mod config;
pub mod events;
pub mod ids;
pub mod metadata;
pub mod types;

pub use config::Config;
pub use events::{EventType, TargetType};
pub use metadata::{
    classify, IssueMeta, ItemKind, MergeFixMeta, PrMergeMeta, ReviewMeta, ReworkMeta,
    SpecflowMeta, TanaMeta,
};
pub use types::{
    AgentSession, AgentStatus, Event, Feature, FeaturePhase, FeatureStatus, GateKind, Heartbeat,
    Id, ItemStatus, Priority, Project, ProjectSettings, WorkItem,
};
