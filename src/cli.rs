//! Command-line front end for one-shot transfers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::config::Settings;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::sftp::SftpClient;
use crate::ssh::{Credential, HostTarget};
use crate::transfer::{TransferReport, TransferService};

/// ferry - pooled SFTP uploads, downloads and server-to-server copies
#[derive(Parser, Debug)]
#[command(name = "ferry")]
#[command(version)]
#[command(after_help = "EXAMPLES:
    # Upload a file (password taken from $FERRY_PASSWORD)
    ferry upload deploy@files.example.com ./build.tar /srv/build.tar

    # Download to stdout with a key
    ferry download -i ~/.ssh/id_ed25519 deploy@files.example.com:2222 /var/log/app.log

    # Copy between two hosts
    ferry relay deploy@a.example.com /srv/db.dump backup@b.example.com /backups/db.dump")]
pub struct Cli {
    /// Path to settings.toml
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Upload a local file
    Upload {
        /// user@host[:port]
        target: String,
        local_path: PathBuf,
        remote_path: String,
        #[command(flatten)]
        auth: AuthArgs,
    },

    /// Download a remote file
    Download {
        /// user@host[:port]
        target: String,
        remote_path: String,
        /// Output file; stdout when omitted
        local_path: Option<PathBuf>,
        #[command(flatten)]
        auth: AuthArgs,
    },

    /// Copy a file from one host to another
    Relay {
        /// Source user@host[:port]
        source: String,
        source_path: String,
        /// Destination user@host[:port]
        destination: String,
        destination_path: String,
        #[command(flatten)]
        auth: AuthArgs,
        /// Private key for the destination; defaults to the source credential
        #[arg(long)]
        dest_identity: Option<PathBuf>,
        /// Environment variable holding the destination password
        #[arg(long)]
        dest_password_env: Option<String>,
    },
}

#[derive(Args, Debug, Clone)]
pub struct AuthArgs {
    /// Private key file; password authentication is used when omitted
    #[arg(short, long)]
    pub identity: Option<PathBuf>,

    /// Environment variable holding the password
    #[arg(long, default_value = "FERRY_PASSWORD")]
    pub password_env: String,

    /// Environment variable holding the key passphrase
    #[arg(long)]
    pub passphrase_env: Option<String>,
}

impl AuthArgs {
    pub fn credential(&self) -> Result<Credential> {
        match &self.identity {
            Some(path) => {
                let passphrase = match &self.passphrase_env {
                    Some(var) => Some(read_env(var)?),
                    None => None,
                };
                Ok(Credential::private_key(path.clone(), passphrase))
            }
            None => Ok(Credential::password(read_env(&self.password_env)?)),
        }
    }
}

fn read_env(var: &str) -> Result<String> {
    std::env::var(var).with_context(|| format!("Environment variable {} is not set", var))
}

/// Settings from `--config`, or from the default location.
pub fn load_settings(path: Option<&PathBuf>) -> Result<Settings> {
    match path {
        Some(path) => Settings::load_from(path)
            .with_context(|| format!("Failed to load settings from {}", path.display())),
        None => Settings::load().context("Failed to load settings"),
    }
}

/// Execute one command against a fresh pool and shut it down afterwards.
pub async fn run(command: Commands, settings: &Settings) -> Result<TransferReport> {
    let pool = Arc::new(ConnectionPool::new(PoolConfig::from(&settings.pool)));
    let reaper = pool.spawn_reaper();
    let client = Arc::new(SftpClient::new(&settings.ssh));
    let service = TransferService::new(pool.clone(), client, settings.transfer.clone());

    let result = dispatch(&service, command, settings.ssh.default_port).await;

    reaper.shutdown().await;
    pool.close_all().await;
    result
}

async fn dispatch(
    service: &TransferService<SftpClient>,
    command: Commands,
    default_port: u16,
) -> Result<TransferReport> {
    let parse = |spec: &str| HostTarget::parse(spec, default_port).map_err(anyhow::Error::msg);

    match command {
        Commands::Upload {
            target,
            local_path,
            remote_path,
            auth,
        } => {
            let target = parse(&target)?;
            let credential = auth.credential()?;
            let mut file = tokio::fs::File::open(&local_path)
                .await
                .with_context(|| format!("Cannot open {}", local_path.display()))?;
            info!(target = %target, path = %remote_path, "Uploading {}", local_path.display());
            Ok(service
                .upload(&target, &credential, &remote_path, &mut file)
                .await?)
        }
        Commands::Download {
            target,
            remote_path,
            local_path,
            auth,
        } => {
            let target = parse(&target)?;
            let credential = auth.credential()?;
            match local_path {
                Some(path) => {
                    let mut file = tokio::fs::File::create(&path)
                        .await
                        .with_context(|| format!("Cannot create {}", path.display()))?;
                    let report = service
                        .download(&target, &credential, &remote_path, &mut file)
                        .await?;
                    file.sync_all().await?;
                    Ok(report)
                }
                None => {
                    let mut stdout = tokio::io::stdout();
                    let report = service
                        .download(&target, &credential, &remote_path, &mut stdout)
                        .await?;
                    stdout.flush().await?;
                    Ok(report)
                }
            }
        }
        Commands::Relay {
            source,
            source_path,
            destination,
            destination_path,
            auth,
            dest_identity,
            dest_password_env,
        } => {
            let source = parse(&source)?;
            let destination = parse(&destination)?;
            let source_credential = auth.credential()?;
            let destination_credential = match (dest_identity, dest_password_env) {
                (Some(_), Some(_)) => {
                    bail!("--dest-identity and --dest-password-env are mutually exclusive")
                }
                (Some(identity), None) => AuthArgs {
                    identity: Some(identity),
                    ..auth
                }
                .credential()?,
                (None, Some(var)) => AuthArgs {
                    identity: None,
                    password_env: var,
                    passphrase_env: None,
                }
                .credential()?,
                (None, None) => auth.credential()?,
            };
            Ok(service
                .transfer_between(
                    &source,
                    &source_credential,
                    &source_path,
                    &destination,
                    &destination_credential,
                    &destination_path,
                )
                .await?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_upload() {
        let cli = Cli::try_parse_from([
            "ferry",
            "upload",
            "deploy@files.example.com",
            "./a.txt",
            "/srv/a.txt",
            "-i",
            "/keys/id",
        ])
        .unwrap();
        match cli.command {
            Commands::Upload { target, auth, .. } => {
                assert_eq!(target, "deploy@files.example.com");
                assert_eq!(auth.identity, Some(PathBuf::from("/keys/id")));
                assert_eq!(auth.password_env, "FERRY_PASSWORD");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn download_output_is_optional() {
        let cli = Cli::try_parse_from(["ferry", "download", "u@h", "/remote"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Download {
                local_path: None,
                ..
            }
        ));
    }

    #[test]
    fn global_config_flag() {
        let cli = Cli::try_parse_from([
            "ferry",
            "relay",
            "a@h1",
            "/x",
            "b@h2",
            "/y",
            "--config",
            "/etc/ferry.toml",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/ferry.toml")));
    }

    #[test]
    fn missing_password_env_is_an_error() {
        let auth = AuthArgs {
            identity: None,
            password_env: "FERRY_TEST_UNSET_PASSWORD_VAR".to_string(),
            passphrase_env: None,
        };
        assert!(auth.credential().is_err());
    }

    #[test]
    fn identity_without_passphrase_builds_key_credential() {
        let auth = AuthArgs {
            identity: Some(PathBuf::from("/keys/id")),
            password_env: "FERRY_PASSWORD".to_string(),
            passphrase_env: None,
        };
        assert!(matches!(
            auth.credential().unwrap(),
            Credential::PrivateKey {
                passphrase: None,
                ..
            }
        ));
    }
}
