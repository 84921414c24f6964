//! HTTP health and status endpoints.

use crate::relay::Relay;
use crate::state::RelayState;
use chrono::{DateTime, Utc};
use natrelay_proto::PublicKey;
use serde::Serialize;
use std::net::SocketAddr;
use warp::http::StatusCode;
use warp::Filter;

#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub id: String,
    pub remote: String,
    pub connected_at: DateTime<Utc>,
    pub idle_ms: u64,
    /// Requests still waiting for a backend response.
    pub pending: usize,
    pub resources: Vec<String>,
    pub session: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub state: RelayState,
    pub recovering: bool,
    pub public_key: Option<PublicKey>,
    pub backend_generation: u64,
    pub recovery_attempts: u32,
    pub sessions_available: usize,
    pub outstanding_requests: usize,
    pub clients: Vec<ClientStatus>,
}

/// `GET /healthz` answers 200 while traffic flows and 503 otherwise;
/// `GET /status` returns [`RelayStatus`] as JSON.
pub fn routes(
    relay: Relay,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let with_relay = warp::any().map(move || relay.clone());

    let healthz = warp::path!("healthz")
        .and(warp::get())
        .and(with_relay.clone())
        .map(|relay: Relay| {
            if relay.state() == RelayState::Opened && !relay.is_recovering() {
                warp::reply::with_status("ok", StatusCode::OK)
            } else {
                warp::reply::with_status("unavailable", StatusCode::SERVICE_UNAVAILABLE)
            }
        });

    let status = warp::path!("status")
        .and(warp::get())
        .and(with_relay)
        .map(|relay: Relay| warp::reply::json(&relay.status()));

    healthz.or(status).with(warp::log("natrelay_relay::status"))
}

/// Serves [`routes`] on `addr` until the relay closes. Returns the bound address.
pub fn spawn(relay: Relay, addr: SocketAddr) -> Result<SocketAddr, warp::Error> {
    let closed = relay.clone();
    let (bound, server) = warp::serve(routes(relay))
        .try_bind_with_graceful_shutdown(addr, async move { closed.wait_closed().await })?;
    tokio::spawn(server);
    log::info!("status endpoint listening on {}", bound);
    Ok(bound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;
    use crate::fake::FakeBackend;
    use k9::assert_equal;
    use natrelay_transport::MemoryTransport;
    use std::sync::Arc;

    fn relay() -> Relay {
        Relay::new(
            RelayConfig::default(),
            Arc::new(MemoryTransport::new()),
            Arc::new(FakeBackend::new()),
        )
    }

    #[tokio::test]
    async fn healthz_follows_lifecycle() {
        let relay = relay();
        let filter = routes(relay.clone());

        let res = warp::test::request().path("/healthz").reply(&filter).await;
        assert_equal!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

        relay.start("token", None).await.unwrap();
        let res = warp::test::request().path("/healthz").reply(&filter).await;
        assert_equal!(res.status(), StatusCode::OK);
        assert_equal!(res.body(), "ok");

        relay.shutdown().await;
        let res = warp::test::request().path("/healthz").reply(&filter).await;
        assert_equal!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn status_reports_state_and_key() {
        let relay = relay();
        let info = relay.start("token", Some("seed")).await.unwrap();
        let filter = routes(relay.clone());

        let res = warp::test::request().path("/status").reply(&filter).await;
        assert_equal!(res.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_equal!(body["state"], "opened");
        assert_equal!(body["public_key"], info.public_key.to_hex().as_str());
        assert_equal!(body["backend_generation"], 1);
        assert!(body["clients"].as_array().unwrap().is_empty());

        relay.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_paths_are_rejected() {
        let filter = routes(relay());
        let res = warp::test::request().path("/nope").reply(&filter).await;
        assert_equal!(res.status(), StatusCode::NOT_FOUND);
    }
}
