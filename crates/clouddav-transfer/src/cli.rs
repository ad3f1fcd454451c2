//! Command line front end for the transfer pipeline.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;

use crate::auth::{Credentials, StaticAuthenticator};
use crate::config::TransferConfig;
use crate::factory::CryptPolicy;
use crate::hash::digest_reader;
use crate::pipeline::TransferPipeline;
use crate::session::{ReqwestTransportFactory, Session, SessionRegistry};

/// `cdav-transfer` arguments.
#[derive(Parser)]
#[command(name = "cdav-transfer")]
#[command(about = "clouddav file transfer tool", long_about = None)]
pub struct Cli {
    /// Configuration file (`.toml` or `.json`); defaults apply when absent.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Account login.
    #[arg(short, long, env = "CDAV_LOGIN", default_value = "anonymous")]
    pub login: String,

    /// Access token for the login.
    #[arg(short, long, env = "CDAV_ACCESS_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Password unlocking encrypted folders.
    #[arg(long, env = "CDAV_CRYPT_PASSWORD", hide_env_values = true)]
    pub crypt_password: Option<String>,

    /// Subcommand.
    #[command(subcommand)]
    pub command: Command,
}

/// Encryption choice on upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CryptArg {
    /// Follow the crypt marker.
    Auto,
    /// Always upload plaintext.
    Plain,
    /// Fail unless encrypted.
    Require,
}

impl From<CryptArg> for CryptPolicy {
    fn from(arg: CryptArg) -> Self {
        match arg {
            CryptArg::Auto => CryptPolicy::Auto,
            CryptArg::Plain => CryptPolicy::ForcePlain,
            CryptArg::Require => CryptPolicy::Require,
        }
    }
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Upload a local file.
    Upload {
        /// Local source file.
        local: PathBuf,
        /// Remote destination path.
        remote: String,
        /// Encryption choice.
        #[arg(long, value_enum, default_value = "auto")]
        crypt: CryptArg,
    },
    /// Download a remote file, or an inclusive byte range of it.
    Download {
        /// Remote source path.
        remote: String,
        /// Local destination; stdout when omitted.
        local: Option<PathBuf>,
        /// First byte of the range.
        #[arg(long, requires = "end")]
        start: Option<u64>,
        /// Last byte of the range (inclusive).
        #[arg(long, requires = "start")]
        end: Option<u64>,
    },
    /// Download a public link.
    LinkDownload {
        /// Public link URI.
        uri: String,
        /// Local destination; stdout when omitted.
        local: Option<PathBuf>,
    },
    /// Print the content digest of a local file.
    Hash {
        /// Local file.
        local: PathBuf,
    },
    /// Mark a remote folder as encrypted.
    InitCrypt {
        /// Remote folder.
        folder: String,
    },
}

impl Cli {
    /// Load the configuration named on the command line.
    pub fn load_config(&self) -> Result<TransferConfig> {
        match &self.config {
            Some(path) => TransferConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display())),
            None => Ok(TransferConfig::default()),
        }
    }

    /// Credentials named on the command line.
    pub fn credentials(&self) -> Credentials {
        let credentials = Credentials::new(&self.login, self.token.clone().unwrap_or_default());
        match &self.crypt_password {
            Some(password) => credentials.with_crypt_password(password),
            None => credentials,
        }
    }

    /// Execute the subcommand.
    pub async fn run(self) -> Result<()> {
        if let Command::Hash { local } = &self.command {
            let mut file = tokio::fs::File::open(local)
                .await
                .with_context(|| format!("opening {}", local.display()))?;
            let (digest, size) = digest_reader(&mut file).await?;
            println!("{}  {}  {}", digest, size, local.display());
            return Ok(());
        }

        let config = self.load_config()?;
        let registry = SessionRegistry::new(
            Arc::new(StaticAuthenticator),
            Arc::new(ReqwestTransportFactory::new(
                config.http.clone(),
                config.download.clone(),
            )),
            config.http.clone(),
        );
        let session = registry.get_or_create(&self.credentials()).await?;
        let pipeline = TransferPipeline::new(config);

        match self.command {
            Command::Upload { local, remote, crypt } => {
                let receipt = pipeline
                    .upload_path(&session, &local, &remote, crypt.into())
                    .await?;
                println!(
                    "{} {} bytes digest {}{}",
                    receipt.path,
                    receipt.plain_size,
                    receipt.digest,
                    if receipt.deduplicated { " (deduplicated)" } else { "" }
                );
            }
            Command::Download { remote, local, start, end } => {
                download(&pipeline, &session, &remote, local.as_deref(), start.zip(end)).await?;
            }
            Command::LinkDownload { uri, local } => {
                let written = match local {
                    Some(path) => {
                        let mut file = tokio::fs::File::create(&path).await?;
                        pipeline.download_link(&session, &uri, &mut file).await?
                    }
                    None => {
                        let mut stdout = tokio::io::stdout();
                        pipeline.download_link(&session, &uri, &mut stdout).await?
                    }
                };
                tracing::info!(%uri, written, "link downloaded");
            }
            Command::InitCrypt { folder } => {
                pipeline.init_crypt_folder(&session, &folder).await?;
                println!("{} is now encrypted", folder);
            }
            Command::Hash { .. } => {}
        }
        Ok(())
    }
}

async fn download(
    pipeline: &TransferPipeline,
    session: &Session,
    remote: &str,
    local: Option<&Path>,
    range: Option<(u64, u64)>,
) -> Result<()> {
    let handle = pipeline
        .stat(session, remote)
        .await?
        .with_context(|| format!("{} not found", remote))?;

    if let Some((start, end)) = range {
        let data = pipeline.download_range(session, &handle, start, end).await?;
        match local {
            Some(path) => tokio::fs::write(path, &data).await?,
            None => {
                let mut stdout = tokio::io::stdout();
                stdout.write_all(&data).await?;
                stdout.flush().await?;
            }
        }
        return Ok(());
    }

    let written = match local {
        Some(path) => {
            let mut file = tokio::fs::File::create(path).await?;
            pipeline.download_to(session, &handle, &mut file).await?
        }
        None => {
            let mut stdout = tokio::io::stdout();
            pipeline.download_to(session, &handle, &mut stdout).await?
        }
    };
    tracing::info!(%remote, written, "downloaded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_upload() {
        let cli = Cli::try_parse_from([
            "cdav-transfer",
            "--login",
            "user@example.com",
            "--token",
            "tok",
            "upload",
            "/tmp/a.bin",
            "/remote/a.bin",
            "--crypt",
            "require",
        ])
        .unwrap();
        match cli.command {
            Command::Upload { ref remote, crypt, .. } => {
                assert_eq!(remote, "/remote/a.bin");
                assert_eq!(CryptPolicy::from(crypt), CryptPolicy::Require);
            }
            ref other => panic!("unexpected command {:?}", other),
        }
        assert!(!cli.credentials().key().login.is_empty());
    }

    #[test]
    fn test_range_needs_both_ends() {
        assert!(Cli::try_parse_from(["cdav-transfer", "download", "/a", "--start", "5"]).is_err());
        let cli =
            Cli::try_parse_from(["cdav-transfer", "download", "/a", "--start", "5", "--end", "9"])
                .unwrap();
        assert!(matches!(
            cli.command,
            Command::Download { start: Some(5), end: Some(9), .. }
        ));
    }

    #[test]
    fn test_crypt_password_reaches_credentials() {
        let plain = Cli::try_parse_from(["cdav-transfer", "-t", "tok", "hash", "/a"]).unwrap();
        let crypt = Cli::try_parse_from([
            "cdav-transfer",
            "-t",
            "tok",
            "--crypt-password",
            "pw",
            "hash",
            "/a",
        ])
        .unwrap();
        assert_eq!(crypt.credentials().crypt_password(), Some("pw"));
        assert_ne!(plain.credentials().key(), crypt.credentials().key());
    }
}
