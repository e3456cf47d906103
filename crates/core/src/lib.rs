pub mod config;
pub mod error;
pub mod time;

pub use config::{
    env_opt, env_or, env_u16, env_u32, env_u64, env_usize, load_dotenv, BusConfig, HttpConfig,
    MqttConfig,
};
pub use error::{AliciaError, ErrorKind};
pub use time::epoch_secs;
