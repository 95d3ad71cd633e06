use std::time::Duration;

use anyhow::Result;
use prometheus::{Encoder, TextEncoder};
use tokio::{select, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::info;

use paddock_lease::{
    actor::Operator,
    clock::SystemClock,
    leadership::{Claimer, LeadershipTracker},
    reaper::ExpiryReaper,
    store::{Key, MemoryStore},
    LeaseClient, LeaseManager, ManagerConfig,
};

use crate::{cli::Commands, initialize_stderr_logging, Cli};

pub struct App {
    cli: Cli,
}

impl App {
    pub fn new(cli: Cli) -> Result<App> {
        Ok(App { cli })
    }

    #[tracing::instrument(skip_all)]
    pub async fn run(&mut self) -> Result<()> {
        println!("paddock {}", env!("CARGO_PKG_VERSION"));
        if self.cli.version() {
            return Ok(());
        }

        initialize_stderr_logging();

        match &self.cli.commands {
            Commands::Run {
                namespace,
                name,
                holders,
                duration_secs,
                reap_interval_secs,
            } => {
                self.run_fleet(
                    Key::new(namespace, name),
                    *holders,
                    Duration::from_secs(*duration_secs),
                    Duration::from_secs(*reap_interval_secs),
                )
                .await
            }
            Commands::Version => Ok(()),
        }
    }

    #[tracing::instrument(skip_all, err)]
    async fn run_fleet(
        &self,
        key: Key,
        holders: usize,
        duration: Duration,
        reap_interval: Duration,
    ) -> Result<()> {
        let cancel = CancellationToken::new();
        let clock = SystemClock;
        let store = MemoryStore::new(clock.clone());

        let registry = prometheus::Registry::new();
        let config = ManagerConfig {
            registry: registry.clone(),
            ..ManagerConfig::default()
        };
        let manager = LeaseManager::new(clock.clone(), store.clone(), config)?;
        let operator = Operator::new(cancel.clone(), manager);
        let client = LeaseClient::new(operator.client());

        let mut tasks: JoinSet<paddock_lease::Result<()>> = JoinSet::new();

        let reaper = ExpiryReaper::new(clock.clone(), store.clone(), reap_interval)?;
        tasks.spawn(reaper.run(cancel.child_token()));

        for i in 0..holders {
            let holder = format!("agent-{i}");
            let claimer = Claimer::new(client.clone(), key.clone(), holder.clone());
            let tracker = LeadershipTracker::new(clock.clone(), claimer, duration);

            let mut leadership = tracker.leadership();
            let watch_cancel = cancel.child_token();
            tasks.spawn(async move {
                loop {
                    select! {
                        _ = watch_cancel.cancelled() => return Ok(()),
                        res = leadership.changed() => {
                            if res.is_err() {
                                return Ok(());
                            }
                            if *leadership.borrow_and_update() {
                                info!(holder, "is now leader");
                            } else {
                                info!(holder, "lost leadership");
                            }
                        }
                    }
                }
            });

            tasks.spawn(tracker.run(cancel.child_token()));
        }

        info!(key = %key, holders, "fleet running until ctrl-c");
        tokio::signal::ctrl_c().await?;
        info!("received ctrl-c, shutting down...");
        cancel.cancel();

        while let Some(res) = tasks.join_next().await {
            res??;
        }
        operator.join().await?;

        // Dump the run's metrics on the way out.
        let mut buf = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buf)?;
        print!("{}", String::from_utf8_lossy(&buf));
        Ok(())
    }
}
