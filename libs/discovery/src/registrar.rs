//! Announces this process as an instance of a service.
use std::sync::Arc;

use relay_core::DiscoveryError;
use tracing::{info, warn};

use crate::backend::{Backend, Registration};

/// Registers and deregisters one [`Registration`] with a backend.
#[derive(Debug)]
pub struct Registrar<B: ?Sized> {
    backend: Arc<B>,
    registration: Registration,
}

impl<B: Backend + ?Sized> Registrar<B> {
    /// registrar for `registration` on `backend`
    pub fn new(backend: Arc<B>, registration: Registration) -> Self {
        Self {
            backend,
            registration,
        }
    }

    /// the registration being managed
    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    /// announce the instance
    pub async fn register(&self) -> Result<(), DiscoveryError> {
        let reg = &self.registration;
        match self.backend.register(reg).await {
            Ok(()) => {
                info!(id = %reg.id, service = %reg.name, addr = %reg.instance(), "registered instance");
                Ok(())
            }
            Err(err) => {
                warn!(id = %reg.id, ?err, "failed to register instance");
                Err(err)
            }
        }
    }

    /// withdraw the instance
    pub async fn deregister(&self) -> Result<(), DiscoveryError> {
        let reg = &self.registration;
        match self.backend.deregister(reg).await {
            Ok(()) => {
                info!(id = %reg.id, "deregistered instance");
                Ok(())
            }
            Err(err) => {
                warn!(id = %reg.id, ?err, "failed to deregister instance");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::ServiceQuery, memory::MemoryBackend, NO_INDEX};
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn test_register_round_trip() {
        let backend = Arc::new(MemoryBackend::new());
        let registrar = Registrar::new(
            backend.clone(),
            Registration::new("users", "10.0.0.1", 9000),
        );
        registrar.register().await.unwrap();
        let q = ServiceQuery::new("users");
        let res = backend.query(&q, NO_INDEX).await.unwrap();
        assert_eq!(res.instances, vec!["10.0.0.1:9000"]);
        assert!(logs_contain("registered instance"));

        registrar.deregister().await.unwrap();
        let res = backend.query(&q, NO_INDEX).await.unwrap();
        assert!(res.instances.is_empty());
    }
}
