mod check_config;
mod record;
mod run;
mod status;

use std::path::PathBuf;

use clap::Args;
use vitals_agent::AgentConfig;
use vitals_agent::config::ConfigOverrides;
use vitals_agent::error::ConfigError;

pub use check_config::run_check_config;
pub use record::{RecordArgs, run_record};
pub use run::{RunArgs, run_agent};
pub use status::run_status;

/// Config file plus the values that may override it.
#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// Path to agent config YAML (defaults apply when omitted)
    #[arg(long, short, env = "VITALS_AGENT_CONFIG")]
    pub config: Option<PathBuf>,
    /// Device identity, overrides `device_id`
    #[arg(long, env = "AGENT_DEVICE_ID")]
    pub device_id: Option<String>,
    /// API host, overrides `api_endpoint`
    #[arg(long, env = "AGENT_API_ENDPOINT")]
    pub api_endpoint: Option<String>,
    /// API port, overrides `api_port`
    #[arg(long, env = "AGENT_API_PORT")]
    pub api_port: Option<u16>,
    /// State directory, overrides `state_dir`
    #[arg(long, env = "AGENT_STATE_DIR")]
    pub state_dir: Option<PathBuf>,
}

impl ConfigArgs {
    pub fn load(&self) -> Result<AgentConfig, ConfigError> {
        let overrides = ConfigOverrides {
            device_id: self.device_id.clone(),
            api_endpoint: self.api_endpoint.clone(),
            api_port: self.api_port,
            state_dir: self.state_dir.clone(),
        };
        AgentConfig::load(self.config.as_deref(), &overrides)
    }
}
