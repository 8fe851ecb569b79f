//! Message transports for modules
//!
//! Payloads are opaque byte frames. Endpoints are `scheme://address`; the
//! [`TransportRegistry`] maps each scheme to a factory.
//!
//! Bundled schemes:
//! - `in-process://name`: the first two opens of the same name are connected
//!   back to back
//! - `unix-socket:///path/to.sock`: length-delimited frames over a Unix
//!   domain socket

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{CdmfError, Result};

#[cfg(unix)]
pub mod unix;

#[cfg(unix)]
pub use unix::{UnixSocketFactory, UnixSocketTransport};

pub const IN_PROCESS_SCHEME: &str = "in-process";
pub const UNIX_SOCKET_SCHEME: &str = "unix-socket";

/// Bidirectional frame transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Endpoint this transport was opened on
    fn endpoint(&self) -> &str;

    /// Send one frame
    async fn send(&self, payload: Bytes) -> Result<()>;

    /// Next frame, or `None` once the peer has closed
    async fn recv(&self) -> Result<Option<Bytes>>;

    /// Stop sending; the peer sees end of stream
    async fn close(&self) -> Result<()>;
}

/// Opens transports for one scheme
#[async_trait]
pub trait TransportFactory: Send + Sync {
    fn scheme(&self) -> &str;

    /// Open `endpoint`; `address` is the part after `scheme://`
    async fn open(&self, endpoint: &str, address: &str) -> Result<Box<dyn Transport>>;
}

/// Split `scheme://address`
pub fn parse_endpoint(endpoint: &str) -> Result<(&str, &str)> {
    match endpoint.split_once("://") {
        Some((scheme, address)) if !scheme.is_empty() && !address.is_empty() => {
            Ok((scheme, address))
        }
        _ => Err(CdmfError::invalid(format!(
            "endpoint {:?} is not scheme://address",
            endpoint
        ))),
    }
}

/// Scheme to factory map
pub struct TransportRegistry {
    factories: RwLock<BTreeMap<String, Arc<dyn TransportFactory>>>,
}

impl TransportRegistry {
    /// Registry without any scheme
    pub fn empty() -> Self {
        Self {
            factories: RwLock::new(BTreeMap::new()),
        }
    }

    /// Registry with the bundled schemes
    pub fn new() -> Self {
        let registry = Self::empty();
        registry.register(Arc::new(InProcessFactory::new()));
        #[cfg(unix)]
        registry.register(Arc::new(UnixSocketFactory));
        registry
    }

    /// Add or replace the factory for its scheme
    pub fn register(&self, factory: Arc<dyn TransportFactory>) {
        let scheme = factory.scheme().to_string();
        debug!("Registered transport scheme {}", scheme);
        self.factories.write().insert(scheme, factory);
    }

    pub fn unregister(&self, scheme: &str) -> bool {
        self.factories.write().remove(scheme).is_some()
    }

    pub fn schemes(&self) -> Vec<String> {
        self.factories.read().keys().cloned().collect()
    }

    /// Open a transport on `endpoint`
    pub async fn open(&self, endpoint: &str) -> Result<Box<dyn Transport>> {
        let (scheme, address) = parse_endpoint(endpoint)?;
        let factory = self
            .factories
            .read()
            .get(scheme)
            .cloned()
            .ok_or_else(|| CdmfError::not_found(format!("transport scheme {}", scheme)))?;
        factory.open(endpoint, address).await
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// One end of an in-process channel pair
pub struct InProcessTransport {
    endpoint: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
}

impl InProcessTransport {
    /// Two connected ends
    pub fn pair(endpoint: &str) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Self::new(endpoint, a_tx, a_rx),
            Self::new(endpoint, b_tx, b_rx),
        )
    }

    fn new(
        endpoint: &str,
        tx: mpsc::UnboundedSender<Bytes>,
        rx: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
        }
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn send(&self, payload: Bytes) -> Result<()> {
        let guard = self.tx.lock();
        let tx = guard.as_ref().ok_or(CdmfError::Closed)?;
        tx.send(payload).map_err(|_| CdmfError::Closed)
    }

    async fn recv(&self) -> Result<Option<Bytes>> {
        Ok(self.rx.lock().await.recv().await)
    }

    async fn close(&self) -> Result<()> {
        self.tx.lock().take();
        Ok(())
    }
}

/// Factory for `in-process://name`
///
/// The first open of a name parks the second end; the next open of the
/// same name collects it.
pub struct InProcessFactory {
    pending: Mutex<HashMap<String, InProcessTransport>>,
}

impl InProcessFactory {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InProcessFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportFactory for InProcessFactory {
    fn scheme(&self) -> &str {
        IN_PROCESS_SCHEME
    }

    async fn open(&self, endpoint: &str, address: &str) -> Result<Box<dyn Transport>> {
        let mut pending = self.pending.lock();
        if let Some(peer) = pending.remove(address) {
            return Ok(Box::new(peer));
        }
        let (local, peer) = InProcessTransport::pair(endpoint);
        pending.insert(address.to_string(), peer);
        Ok(Box::new(local))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_process_pair() {
        let registry = TransportRegistry::new();
        let a = registry.open("in-process://bus").await.unwrap();
        let b = registry.open("in-process://bus").await.unwrap();
        assert_eq!(a.endpoint(), "in-process://bus");

        a.send(Bytes::from_static(b"ping")).await.unwrap();
        b.send(Bytes::from_static(b"pong")).await.unwrap();
        assert_eq!(b.recv().await.unwrap().unwrap(), Bytes::from_static(b"ping"));
        assert_eq!(a.recv().await.unwrap().unwrap(), Bytes::from_static(b"pong"));

        a.close().await.unwrap();
        assert!(matches!(a.send(Bytes::new()).await, Err(CdmfError::Closed)));
        assert_eq!(b.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_scheme_and_bad_endpoint() {
        let registry = TransportRegistry::new();
        assert!(matches!(
            registry.open("carrier-pigeon://x").await,
            Err(CdmfError::NotFound(_))
        ));
        assert!(matches!(
            registry.open("no-scheme").await,
            Err(CdmfError::InvalidArgument(_))
        ));
        assert!(registry.schemes().contains(&IN_PROCESS_SCHEME.to_string()));
    }
}
