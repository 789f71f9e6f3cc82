use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::client::{ClientSettings, QueueClient};
use super::{JobSpec, QueueError};

pub const DEFAULT_MAX_IDLE_CLIENTS: usize = 8;

/// Something that can enqueue a job body on the broker.
pub trait JobProducer: Send + Sync {
    fn put(&self, spec: &JobSpec, data: &[u8]) -> Result<u64, QueueError>;
}

/// Keeps idle broker clients for reuse across threads.
///
/// A client is handed to one caller at a time through [`PooledClient`]; when
/// the guard goes out of scope the client comes back, unless a transport
/// failure reaped it, in which case it is closed and forgotten.
pub struct ClientPool {
    settings: ClientSettings,
    idle: Mutex<Vec<QueueClient>>,
    max_idle: usize,
}

impl ClientPool {
    pub fn new(settings: ClientSettings, max_idle: usize) -> Self {
        Self {
            settings,
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    pub fn acquire(&self) -> PooledClient<'_> {
        let recycled = self.idle_clients().pop();
        let client = recycled.unwrap_or_else(|| QueueClient::new(self.settings.clone()));
        PooledClient {
            pool: self,
            client: Some(client),
        }
    }

    #[cfg(test)]
    pub fn idle_count(&self) -> usize {
        self.idle_clients().len()
    }

    // The idle list stays consistent across a panicking holder, so a poisoned
    // lock is recovered rather than taking the intake threads down with it.
    fn idle_clients(&self) -> MutexGuard<'_, Vec<QueueClient>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn done(&self, mut client: QueueClient) {
        if client.is_reaped() {
            client.close();
            return;
        }

        let mut idle = self.idle_clients();
        if idle.len() < self.max_idle {
            idle.push(client);
        } else {
            drop(idle);
            client.close();
        }
    }
}

impl JobProducer for ClientPool {
    fn put(&self, spec: &JobSpec, data: &[u8]) -> Result<u64, QueueError> {
        self.acquire().put(spec, data)
    }
}

pub struct PooledClient<'a> {
    pool: &'a ClientPool,
    client: Option<QueueClient>,
}

impl Deref for PooledClient<'_> {
    type Target = QueueClient;

    fn deref(&self) -> &Self::Target {
        self.client
            .as_ref()
            .expect("pooled client accessed after release")
    }
}

impl DerefMut for PooledClient<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.client
            .as_mut()
            .expect("pooled client accessed after release")
    }
}

impl Drop for PooledClient<'_> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool.done(client);
        }
    }
}
