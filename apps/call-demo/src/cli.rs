use std::path::PathBuf;

use clap::{Args, Parser};

use crate::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "call-demo",
    about = "Place a call between two in-process peers and exchange one data channel message",
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[arg(long, default_value = "alice", help = "Peer id of the caller")]
    pub caller: String,

    #[arg(long, default_value = "bob", help = "Peer id of the callee")]
    pub callee: String,

    #[arg(long, default_value = "chat", help = "Label of the data channel to open")]
    pub channel: String,

    #[arg(long, default_value = "hello from the caller", help = "Text sent once the channel opens")]
    pub message: String,

    #[arg(
        long = "localhost-only",
        env = "CALL_LOCALHOST_ONLY",
        help = "Skip STUN servers and gather host candidates only"
    )]
    pub localhost_only: bool,

    #[arg(
        long = "timeout-secs",
        default_value_t = 20,
        help = "Give up if the exchange has not completed by then"
    )]
    pub timeout_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "CALL_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "CALL_LOG_FILE",
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let cli = Cli::try_parse_from(["call-demo"]).expect("defaults");
        assert_eq!(cli.caller, "alice");
        assert_eq!(cli.channel, "chat");
        assert_eq!(cli.logging.level, LogLevel::Warn);
    }

    #[test]
    fn log_level_flag() {
        let cli = Cli::try_parse_from(["call-demo", "--log-level", "debug", "--localhost-only"])
            .expect("flags");
        assert_eq!(cli.logging.level, LogLevel::Debug);
        assert!(cli.localhost_only);
    }
}
