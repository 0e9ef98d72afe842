use clap::Parser;
use std::path::PathBuf;
use tracing::warn;
use uuid::Uuid;

/// Sidecar daemon for the institute dashboard. Speaks one JSON request per line on stdin.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Workspace folder holding campus.sqlite3; opened at startup when given.
    #[arg(long, env = "CAMPUSD_WORKSPACE")]
    pub workspace: Option<PathBuf>,

    /// Secret used to sign bearer tokens.
    #[arg(long, env = "CAMPUSD_SIGNING_SECRET", hide_env_values = true)]
    pub signing_secret: Option<String>,

    /// Lifetime of issued tokens.
    #[arg(long, env = "CAMPUSD_TOKEN_TTL_MINUTES", default_value_t = 720)]
    pub token_ttl_minutes: i64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub workspace: Option<PathBuf>,
    pub signing_secret: Vec<u8>,
    pub token_ttl_minutes: i64,
}

impl Config {
    pub fn from_args(args: Args) -> Self {
        let signing_secret = match args.signing_secret {
            Some(s) if !s.trim().is_empty() => s.into_bytes(),
            _ => {
                warn!("no signing secret configured; tokens will not survive a restart");
                let mut secret = Vec::with_capacity(32);
                secret.extend_from_slice(Uuid::new_v4().as_bytes());
                secret.extend_from_slice(Uuid::new_v4().as_bytes());
                secret
            }
        };
        Self {
            workspace: args.workspace,
            signing_secret,
            token_ttl_minutes: args.token_ttl_minutes.max(1),
        }
    }
}
