use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

pub mod jobs;
pub mod ports;

#[derive(Parser)]
#[command(name = "foreman")]
#[command(about = "Foreman - free ports, stop process trees and run tracked jobs")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect or free TCP ports
    #[command(subcommand)]
    Ports(PortsCommands),
    /// Terminate a process and all of its descendants
    KillTree {
        /// Root process ID
        pid: u32,
    },
    /// Run a command as a tracked job and stream its output
    Run(RunArgs),
}

#[derive(Subcommand)]
pub enum PortsCommands {
    /// List the PIDs listening on each port
    List {
        #[arg(required = true)]
        ports: Vec<u16>,
    },
    /// Terminate whatever listens on each port and wait until it is free
    Free {
        #[arg(required = true)]
        ports: Vec<u16>,
        /// How long to wait for the ports to clear (defaults to FOREMAN_PORT_FREE_TIMEOUT_MS)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[derive(Args)]
pub struct RunArgs {
    /// Project the job belongs to
    #[arg(long)]
    pub project: String,
    /// Job type, e.g. frontend:test
    #[arg(long = "type")]
    pub job_type: String,
    /// Working directory (defaults to the current directory)
    #[arg(long)]
    pub cwd: Option<PathBuf>,
    /// Human readable name (defaults to the title-cased type)
    #[arg(long)]
    pub name: Option<String>,
    /// Free this port before starting; may be repeated
    #[arg(long = "free-port")]
    pub free_ports: Vec<u16>,
    /// Command and arguments
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "foreman",
            "run",
            "--project",
            "web",
            "--type",
            "frontend:test",
            "--free-port",
            "5173",
            "--",
            "npm",
            "test",
            "--",
            "--watch=false",
        ])
        .unwrap();

        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.project, "web");
        assert_eq!(args.job_type, "frontend:test");
        assert_eq!(args.free_ports, vec![5173]);
        assert_eq!(args.command, vec!["npm", "test", "--", "--watch=false"]);
        assert!(args.cwd.is_none());
    }

    #[test]
    fn test_parse_ports_free_with_timeout() {
        let cli =
            Cli::try_parse_from(["foreman", "ports", "free", "5173", "6200", "--timeout-ms", "500"])
                .unwrap();

        let Commands::Ports(PortsCommands::Free { ports, timeout_ms }) = cli.command else {
            panic!("expected ports free");
        };
        assert_eq!(ports, vec![5173, 6200]);
        assert_eq!(timeout_ms, Some(500));
    }

    #[rstest]
    #[case(&["foreman", "ports", "list"])]
    #[case(&["foreman", "ports", "free", "70000"])]
    #[case(&["foreman", "kill-tree", "abc"])]
    #[case(&["foreman", "run", "--project", "web", "--type", "lint"])]
    fn test_rejects_invalid_arguments(#[case] argv: &[&str]) {
        assert!(Cli::try_parse_from(argv).is_err());
    }
}
