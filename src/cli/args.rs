//! CLI argument parsing

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "berth")]
#[command(author, version, about = "Provision and reap per-user challenge containers", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: SubCommand,

    /// Use an in-process runtime instead of Docker; nothing is persisted
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Output format as JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Settings file (flat JSON object)
    #[arg(long, global = true, env = "BERTH_SETTINGS", default_value = "berth-settings.json")]
    pub settings: PathBuf,

    /// Tracked-container state file
    #[arg(long, global = true, env = "BERTH_STATE", default_value = "berth-state.json")]
    pub state: PathBuf,

    /// Challenge catalog (JSON array)
    #[arg(long, global = true, env = "BERTH_CATALOG", default_value = "challenges.json")]
    pub catalog: PathBuf,

    /// Docker client timeout in seconds
    #[arg(long, global = true, default_value = "30")]
    pub timeout: u64,

    /// Directory with key.pem, cert.pem and ca.pem for TLS endpoints
    #[arg(long, global = true, env = "BERTH_TLS_CERTS")]
    pub tls_certs: Option<PathBuf>,
}

/// Who a container is for
#[derive(ClapArgs, Debug, Clone, Copy)]
pub struct SubjectArgs {
    /// Challenge id
    pub challenge: u64,

    /// Requesting user id
    #[arg(long)]
    pub user: u64,

    /// Team id, required when team mode is enabled
    #[arg(long)]
    pub team: Option<u64>,
}

#[derive(Subcommand)]
pub enum SubCommand {
    /// Connect to the endpoints and reap expired containers until Ctrl+C
    Serve,

    /// Request a container, reusing a running one
    Request(SubjectArgs),

    /// Show connection details of a running container
    Info(SubjectArgs),

    /// Push a container's expiry out
    Renew(SubjectArgs),

    /// Stop a subject's container
    Stop(SubjectArgs),

    /// Show how players connect to a challenge
    ConnectType {
        /// Challenge id
        challenge: u64,
    },

    /// Kill a tracked container by id
    Kill {
        /// Runtime container id
        id: String,
    },

    /// Kill every tracked container
    Purge,

    /// List images available on the endpoints
    Images,

    /// List tracked containers
    Containers,

    /// List connected endpoints
    Endpoints,

    /// Replace the settings and reconnect
    UpdateSettings {
        /// Setting in the form key=value
        #[arg(long = "set", value_name = "KEY=VALUE")]
        values: Vec<String>,
    },
}

/// Split `key=value` pairs
pub fn parse_key_values(values: &[String]) -> Result<Vec<(String, String)>, String> {
    values
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.to_string()))
                .filter(|(k, _)| !k.is_empty())
                .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", pair))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_values() {
        let parsed = parse_key_values(&[
            "docker_hostname=ctf.example.org".to_string(),
            r#"docker_servers={"main": "tcp://a=b:2376"}"#.to_string(),
        ])
        .unwrap();
        assert_eq!(parsed[0], ("docker_hostname".to_string(), "ctf.example.org".to_string()));
        assert_eq!(parsed[1].1, r#"{"main": "tcp://a=b:2376"}"#);

        assert!(parse_key_values(&["novalue".to_string()]).is_err());
        assert!(parse_key_values(&["=x".to_string()]).is_err());
    }

    #[test]
    fn test_subject_args() {
        let args = Args::try_parse_from(["berth", "request", "4", "--user", "7", "--team", "2"]).unwrap();
        match args.command {
            SubCommand::Request(subject) => {
                assert_eq!(subject.challenge, 4);
                assert_eq!(subject.user, 7);
                assert_eq!(subject.team, Some(2));
            }
            _ => panic!("expected request"),
        }
    }
}
