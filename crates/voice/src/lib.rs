pub mod messages;
pub mod rate;

pub use messages::{
    new_session_id, AiJob, AiResult, SttJob, SttResult, TtsJob, TtsResult,
};
pub use rate::{RateLimiter, RateLimits};
