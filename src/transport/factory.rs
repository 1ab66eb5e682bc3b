//! Transport creation by URL scheme

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use super::{LocalRepoTransport, RepoTransport, TransportResult};
use crate::error::TransportError;
use crate::repo::RepoRegistry;
use crate::util;

/// Creates transports for the URLs it supports
#[async_trait]
pub trait TransportFactory: Send + Sync {
	/// True if this factory handles `url`
	fn supports(&self, url: &str) -> bool;

	/// Transport for `url` acting on behalf of `client_repository_id`
	async fn create(&self, url: &str, client_repository_id: Uuid) -> TransportResult<Box<dyn RepoTransport>>;
}

/// Factory for `file://` URLs
pub struct LocalTransportFactory {
	registry: RepoRegistry,
}

impl LocalTransportFactory {
	pub fn new(registry: RepoRegistry) -> Self {
		LocalTransportFactory { registry }
	}
}

#[async_trait]
impl TransportFactory for LocalTransportFactory {
	fn supports(&self, url: &str) -> bool {
		util::url_scheme(url) == Some("file")
	}

	async fn create(&self, url: &str, client_repository_id: Uuid) -> TransportResult<Box<dyn RepoTransport>> {
		let registry = self.registry.clone();
		let url = url.to_string();
		let transport = tokio::task::spawn_blocking(move || {
			LocalRepoTransport::open(&registry, &url, client_repository_id)
		})
		.await??;
		Ok(Box::new(transport))
	}
}

/// Ordered list of transport factories; the first that supports a URL wins
#[derive(Clone, Default)]
pub struct TransportRegistry {
	factories: Vec<Arc<dyn TransportFactory>>,
}

impl TransportRegistry {
	pub fn new() -> Self {
		TransportRegistry { factories: Vec::new() }
	}

	/// Registry with the `file://` factory
	pub fn with_local(registry: RepoRegistry) -> Self {
		let mut transports = Self::new();
		transports.register(Arc::new(LocalTransportFactory::new(registry)));
		transports
	}

	pub fn register(&mut self, factory: Arc<dyn TransportFactory>) {
		self.factories.push(factory);
	}

	pub async fn create(&self, url: &str, client_repository_id: Uuid) -> TransportResult<Box<dyn RepoTransport>> {
		match self.factories.iter().find(|f| f.supports(url)) {
			Some(factory) => factory.create(url, client_repository_id).await,
			None => Err(TransportError::Unsupported { url: url.to_string() }),
		}
	}
}


// vim: ts=4
