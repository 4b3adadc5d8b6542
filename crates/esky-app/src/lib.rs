mod config;
mod esky;

pub use config::{
    EscalationConfig, EskyConfig, FinderConfig, TransactionConfig, CONFIG_ENV,
    DEFAULT_CONFIG_FILE,
};
pub use esky::{is_permission_error, running_from_env, Esky, UpdateStep};

#[cfg(test)]
mod tests;
