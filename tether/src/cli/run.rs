use std::time::Duration;

use clap::Args;

use crate::{cli::Error, config::Config, controller::Controller};

#[derive(Args, Clone, Default)]
pub struct RunCommand {
    #[arg(
        long = "resync-interval",
        value_name = "SECONDS",
        help = "Override the interval after which every object is reconciled again"
    )]
    resync_interval: Option<u64>,
}

impl RunCommand {
    pub async fn run(self, kube_client: kube::Client, mut config: Config) -> Result<(), Error> {
        if let Some(seconds) = self.resync_interval {
            config.resync_interval = Duration::from_secs(seconds.max(1));
        }
        Controller::new(kube_client, &config).serve().await?;
        Ok(())
    }
}
