pub mod analysis;
pub mod chain;
pub mod config;
pub mod context;
pub mod email;
pub mod job;
pub mod metrics;
pub mod status;

pub use analysis::{Phase1Result, Phase2Result, Phase3Result, Priority};
pub use chain::{Chain, ChainType};
pub use context::OpCtx;
pub use email::{Email, NormalizedEmail, Recipient, RecipientKind};
pub use job::{Job, Phase};
pub use metrics::MetricsHub;
pub use status::{EmailStatus, UiStatus};
