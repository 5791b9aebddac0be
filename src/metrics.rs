use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, TransportErrorKind};

/// Relay-level gauges plus whatever the libp2p metrics adapter records into
/// the shared registry.
#[derive(Debug, Clone)]
pub struct RelayGauges {
    pub connected_peers: Gauge,
    pub local_rooms: Gauge,
    pub participants: Gauge,
}

impl RelayGauges {
    pub fn register(registry: &mut Registry) -> Self {
        let connected_peers = Gauge::default();
        let local_rooms = Gauge::default();
        let participants = Gauge::default();

        registry.register(
            "relay_connected_peers",
            "Peers currently connected to this relay",
            connected_peers.clone(),
        );
        registry.register(
            "relay_local_rooms",
            "Rooms currently hosted or mirrored by this relay",
            local_rooms.clone(),
        );
        registry.register(
            "relay_participants",
            "Participants currently served by this relay",
            participants.clone(),
        );

        RelayGauges {
            connected_peers,
            local_rooms,
            participants,
        }
    }
}

/// Serves `GET /debug/metrics/prometheus` until cancelled.
pub async fn serve(
    port: u16,
    registry: Arc<Mutex<Registry>>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let app = Router::new()
        .route("/debug/metrics/prometheus", get(render))
        .with_state(registry);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| {
            Error::new_transport(
                format!("failed to bind metrics port {}: {}", port, e),
                TransportErrorKind::NetworkUnreachable,
            )
        })?;

    tracing::info!(
        "Prometheus metrics at http://0.0.0.0:{}/debug/metrics/prometheus",
        port
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| {
            Error::new_transport(
                format!("metrics server failed: {}", e),
                TransportErrorKind::NetworkUnreachable,
            )
        })
}

async fn render(State(registry): State<Arc<Mutex<Registry>>>) -> impl IntoResponse {
    let mut body = String::new();
    let result = {
        let registry = registry.lock().unwrap();
        encode(&mut body, &registry)
    };

    match result {
        Ok(()) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            tracing::error!("failed to encode metrics: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauges_show_up_in_encoded_output() {
        let mut registry = Registry::default();
        let gauges = RelayGauges::register(&mut registry);
        gauges.connected_peers.set(3);
        gauges.local_rooms.set(1);

        let mut body = String::new();
        encode(&mut body, &registry).unwrap();
        assert!(body.contains("relay_connected_peers 3"));
        assert!(body.contains("relay_local_rooms 1"));
        assert!(body.contains("relay_participants 0"));
    }
}
