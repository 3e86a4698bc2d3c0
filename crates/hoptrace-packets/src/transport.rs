//! Raw ICMP transport.

use crate::connection::RawIcmpConnection;
use async_trait::async_trait;
use hoptrace_core::{AddressFamily, Network, ProbeConfig, TracerouteError, Transport};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

/// [`Transport`] over a raw ICMP socket.
///
/// The socket is opened on the first [`acquire_connection`] and shared by
/// every later call. A failed open is not remembered, so the next call tries
/// again.
///
/// [`acquire_connection`]: Transport::acquire_connection
#[derive(Default)]
pub struct IcmpTransport {
    conn: OnceCell<Arc<RawIcmpConnection>>,
}

impl IcmpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once a connection has been opened.
    pub fn is_connected(&self) -> bool {
        self.conn.initialized()
    }
}

#[async_trait]
impl Transport for IcmpTransport {
    type Connection = RawIcmpConnection;

    async fn acquire_connection(
        &self,
        config: &ProbeConfig,
        family: AddressFamily,
    ) -> Result<Arc<RawIcmpConnection>, TracerouteError> {
        // Only ICMP Echo over IP is implemented.
        if config.network != Network::Ip {
            return Err(TracerouteError::UnsupportedNetwork(config.network));
        }

        let conn = self
            .conn
            .get_or_try_init(|| async {
                debug!(family = %family, "Opening probe connection");
                RawIcmpConnection::open(family, config.source).map(Arc::new)
            })
            .await?;

        if conn.family() != family {
            return Err(TracerouteError::Internal(format!(
                "connection already open for {}, cannot probe over {}",
                conn.family(),
                family
            )));
        }

        Ok(Arc::clone(conn))
    }
}
