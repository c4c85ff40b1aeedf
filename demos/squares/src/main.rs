use std::{num::NonZeroUsize, thread, time::Duration};

use anyhow::Context;
use orderpool::{
    message::{infallible, transform},
    Config, Distributor, Isolation,
};
use tracing_subscriber::{
    fmt,
    prelude::*,
    EnvFilter,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    tracing::info!("starting squares example...");

    let mut config = Config::with_workers(NonZeroUsize::new(3).context("zero workers")?);
    config.isolation = Isolation::Thread;
    config.job_timeout = Some(Duration::from_secs(5));

    let mut distributor = Distributor::new(config);

    // Keep the pool up across both calls.
    distributor
        .start(infallible(|x: u64| x))
        .await
        .context("error starting pool")?;

    // Uneven work so results complete out of order.
    let squares = infallible(|x: u64| {
        thread::sleep(Duration::from_millis((7 - x) * 20));
        x * x
    });
    let results = distributor
        .map(squares, 0..7)
        .await
        .context("error mapping squares")?;
    println!("squares: {results:?}");

    let checked = transform(|x: u64| {
        if x == 3 {
            anyhow::bail!("refusing to work on {x}");
        }
        Ok(x * 2)
    });
    for (x, result) in (1..=4).zip(distributor.map(checked, 1..=4).await?) {
        match result {
            Ok(value) => println!("{x} -> {value}"),
            Err(err) => println!("{x} -> (ಥ﹏ಥ) {err}"),
        }
    }

    for status in distributor.pool_mut().status_all().await? {
        tracing::info!(
            worker_id = status.pid,
            jobs = status.jobs_finished,
            working = ?status.time_working,
            "worker status"
        );
    }

    distributor.close().await?;

    Ok(())
}
