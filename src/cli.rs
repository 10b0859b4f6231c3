/// CLI argument parsing

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

// Build timestamp injected at compile time
pub const VERSION_WITH_BUILD: &str = concat!(env!("CARGO_PKG_VERSION"), " (built: ", env!("BUILD_TIMESTAMP"), ")");

#[derive(Parser)]
#[command(name = "marzban-backup")]
#[command(author, version = VERSION_WITH_BUILD, about = "Backup and restore for Marzban installations", long_about = None)]
pub struct Cli {
    /// Config file (default: ~/.config/marzban-backup/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a backup archive and upload it when Telegram is configured
    RunBackup {
        /// Keep the archive local even when Telegram is configured
        #[arg(long)]
        no_upload: bool,
    },

    /// Restore the installation from a backup archive
    DoRestore {
        /// Path to a marzban_backup_*.tar.gz archive
        archive: PathBuf,
    },

    /// Install or refresh the periodic backup job, then run one backup
    DoAutoBackupSetup {
        /// Interval in minutes (defaults to telegram.backup_interval)
        #[arg(long)]
        interval: Option<u32>,

        /// Remove the job instead
        #[arg(long, conflicts_with = "interval")]
        disable: bool,
    },

    /// Print the detected database engine
    GetDbType,

    /// Show last runs and the auto-backup job
    Status,

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration with secrets masked
    View,

    /// Check the configuration for errors
    Validate,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_restore_with_global_flags() {
        let cli = Cli::parse_from(["marzban-backup", "do-restore", "/root/b.tar.gz", "--json", "-vv"]);

        assert!(cli.json);
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::DoRestore { archive } if archive == PathBuf::from("/root/b.tar.gz")));
    }

    #[test]
    fn test_disable_conflicts_with_interval() {
        let result = Cli::try_parse_from(["marzban-backup", "do-auto-backup-setup", "--disable", "--interval", "60"]);
        assert!(result.is_err());
    }
}
