use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use live_client::config::LiveConfig;
use live_client::telemetry::{LogConfig, LogLevel};
use live_client::{Channel, Endpoint};

#[derive(Parser, Debug)]
#[command(
    name = "judge-live",
    about = "Follow live judge, notification and message updates from the terminal",
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "HOST[:PORT]",
        help = "Judge host; overrides JUDGE_LIVE_HOST"
    )]
    pub host: Option<String>,

    #[arg(
        long,
        global = true,
        help = "Use wss/https instead of ws/http; overrides JUDGE_LIVE_SECURE"
    )]
    pub secure: bool,

    #[arg(
        long,
        global = true,
        env = "JUDGE_LIVE_UID",
        value_name = "UID",
        help = "Signed-in user id that scopes the live channels"
    )]
    pub uid: Option<String>,

    #[arg(
        long,
        global = true,
        env = "JUDGE_LIVE_TOKEN",
        value_name = "TOKEN",
        hide_env_values = true,
        help = "Bearer token for the chat endpoints"
    )]
    pub token: Option<String>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Environment configuration with command-line overrides applied.
    pub fn live_config(&self) -> LiveConfig {
        let mut config = LiveConfig::from_env();
        if let Some(host) = &self.host {
            config.endpoint = Endpoint::new(host.clone(), self.secure || config.endpoint.secure);
        } else if self.secure {
            config.endpoint.secure = true;
        }
        config
    }
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "JUDGE_LIVE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "JUDGE_LIVE_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print live events until interrupted
    Watch(WatchArgs),
    /// Ask the assistant and stream its reply
    Chat {
        #[arg(required = true, num_args = 1.., help = "Message to send")]
        message: Vec<String>,
    },
    /// Print the stored assistant conversation
    History,
    /// Delete the stored assistant conversation
    Clear,
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    #[arg(
        long = "channel",
        short = 'c',
        value_enum,
        help = "Channel to follow; repeat for several (default: all)"
    )]
    pub channels: Vec<Channel>,

    #[arg(long, value_name = "SECS", help = "Stop after this many seconds")]
    pub duration: Option<u64>,
}

impl WatchArgs {
    pub fn selected(&self) -> Vec<Channel> {
        if self.channels.is_empty() {
            Channel::ALL.to_vec()
        } else {
            let mut channels = self.channels.clone();
            channels.dedup();
            channels
        }
    }
}
