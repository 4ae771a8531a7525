//! Retention: periodically drop traceroutes and IP-info records past
//! their expiry. Children go along through the cascades.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{HOUSEKEEPER_INTERVAL, IP_INFO_EXPIRY, TRACEROUTE_EXPIRY};
use crate::ip_info::IpInfoStore;
use crate::traceroute::TracerouteStore;

pub async fn run_housekeeper(store: &TracerouteStore, ip_info_store: &IpInfoStore) {
    info!("running the housekeeper");

    match store.remove_old_entries(TRACEROUTE_EXPIRY).await {
        Ok(n) if n > 0 => info!("housekeeper: removed {n} expired traceroutes"),
        Ok(_) => {}
        Err(e) => error!("housekeeper: traceroute cleanup failed: {e}"),
    }

    match ip_info_store.remove_old_entries(IP_INFO_EXPIRY).await {
        Ok(n) if n > 0 => info!("housekeeper: removed {n} expired IP info records"),
        Ok(_) => {}
        Err(e) => error!("housekeeper: IP info cleanup failed: {e}"),
    }

    info!("housekeeper completed");
}

/// One run at startup, then every `HOUSEKEEPER_INTERVAL`.
pub fn spawn_housekeeper(
    store: TracerouteStore,
    ip_info_store: IpInfoStore,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            run_housekeeper(&store, &ip_info_store).await;

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(HOUSEKEEPER_INTERVAL) => {}
            }
        }
    })
}
