//! `wd login`

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use wd_rest_client::RestClient;

use crate::bootstrap;

#[derive(Args)]
pub struct LoginArgs {
    /// Control-plane URL
    #[arg(value_name = "URL")]
    pub url: String,

    #[arg(long = "username", short = 'u')]
    pub username: String,

    /// Password; exchanged for a token
    #[arg(long = "password", short = 'p')]
    pub password: Option<String>,

    /// Pre-issued token; stored as-is
    #[arg(long = "token", short = 't')]
    pub token: Option<String>,
}

impl LoginArgs {
    pub async fn run(self) -> Result<()> {
        let token = match (self.password, self.token) {
            (_, Some(token)) => token,
            (Some(password), None) => {
                let client = RestClient::from_url(&self.url, None).context("bad login URL")?;
                client
                    .login(&self.username, &password)
                    .await
                    .context("login failed")?
            }
            (None, None) => anyhow::bail!("provide --password or --token"),
        };

        let store = bootstrap::profile_store()?;
        let mut profile = store.load()?;
        profile.upsert_auth(&self.url, &self.username, &token);
        store.save(&profile)?;
        info!(user = %self.username, url = %self.url, "logged in");
        Ok(())
    }
}
