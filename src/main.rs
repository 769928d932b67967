//! kube-consul-register daemon entry point.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::signal;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use kube_consul_register::cluster::KubeCluster;
use kube_consul_register::config::Config;
use kube_consul_register::consul::HttpConnector;
use kube_consul_register::controller::{self, Controller};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting kube-consul-register with config: {:?}", cfg);

    let client = kube::Client::try_default().await?;
    let cluster = Arc::new(KubeCluster::new(client, cfg.namespace.clone()));
    let connector = Arc::new(HttpConnector::new(&cfg.consul)?);

    // Fails fast on resource sources without an implementation
    let controller = controller::new(&cfg, cluster, connector)?;

    let mut handles = Arc::clone(&controller).watch();
    handles.push(spawn_periodic(Pass::Sync, cfg.sync_interval(), Arc::clone(&controller)));
    handles.push(spawn_periodic(Pass::Clean, cfg.clean_interval(), Arc::clone(&controller)));

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    for handle in handles {
        handle.abort();
    }

    info!("Shutdown complete.");
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum Pass {
    Sync,
    Clean,
}

/// Run `pass` every `period`, starting immediately. Failures are logged and
/// left for the next tick.
fn spawn_periodic(pass: Pass, period: Duration, controller: Arc<dyn Controller>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            info!("Running {:?}", pass);
            let result = match pass {
                Pass::Sync => controller.sync().await,
                Pass::Clean => controller.clean().await,
            };
            if let Err(e) = result {
                error!("{:?} failed: {}", pass, e);
            }
        }
    })
}
