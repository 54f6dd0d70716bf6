use std::time::Duration;

use clap::Args;

#[derive(Debug, Args, Clone)]
pub struct FrontConfig {
    /// Timeout for server to process each request.
    #[arg(env, long, default_value = "30s")]
    pub server_timeout: humantime::Duration,
}

impl Default for FrontConfig {
    fn default() -> Self {
        Self {
            server_timeout: Duration::from_secs(30).into(),
        }
    }
}
