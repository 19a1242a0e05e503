//! Process-wide, single-flight access to the personalization connection.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Duration,
};

use tokio::sync::OnceCell;

use crate::{
    connection::{Connection, PersonalizationClient},
    Error, Result,
};

/// Lifecycle of the connection held by a [`ConnectionProvider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No initialization has been attempted yet (or the provider was re-armed).
    Uninitialized,
    /// An initialization attempt is in flight. Callers wait for its outcome.
    Initializing,
    /// The connection is established.
    Ready,
    /// Initialization failed. The failure is returned to every caller until
    /// [`ConnectionProvider::rearm`] is called.
    Failed,
}

type Slot = Arc<OnceCell<Result<Arc<dyn Connection>>>>;

/// Owns the only personalization connection of the process.
///
/// Construct it once at startup and pass it (via `Arc`) to the components that need a connection.
///
/// # Failure policy
///
/// - A missing project uid fails fast with [`Error::NotConfigured`] and is **not** cached: once a
///   uid is supplied with [`ConnectionProvider::set_project_uid`], the next call initializes
///   normally.
/// - Any other initialization error (including the init timeout) **is** cached. Every later call
///   gets the same error without another network attempt until [`ConnectionProvider::rearm`] is
///   called.
pub struct ConnectionProvider {
    client: Arc<dyn PersonalizationClient>,
    project_uid: RwLock<Option<String>>,
    init_timeout: Duration,
    slot: Mutex<Slot>,
    initializing: AtomicBool,
}

impl ConnectionProvider {
    /// Create a provider. No connection is attempted until the first
    /// [`ConnectionProvider::get_connection`] call.
    pub fn new(
        client: Arc<dyn PersonalizationClient>,
        project_uid: Option<String>,
        init_timeout: Duration,
    ) -> ConnectionProvider {
        ConnectionProvider {
            client,
            project_uid: RwLock::new(project_uid.filter(|uid| !uid.trim().is_empty())),
            init_timeout,
            slot: Mutex::new(Arc::new(OnceCell::new())),
            initializing: AtomicBool::new(false),
        }
    }

    /// Supply the project uid after construction (e.g., when configuration arrives late).
    pub fn set_project_uid(&self, project_uid: impl Into<String>) {
        let project_uid = project_uid.into();
        let mut slot = self
            .project_uid
            .write()
            .expect("thread holding project uid lock should not panic");
        *slot = Some(project_uid).filter(|uid| !uid.trim().is_empty());
    }

    /// Get the connection, initializing it on first use.
    ///
    /// Concurrent callers during initialization all await the single in-flight attempt and
    /// receive its outcome.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConfigured`] if no project uid is set.
    /// - The cached initialization error if setup failed.
    pub async fn get_connection(&self) -> Result<Arc<dyn Connection>> {
        let Some(project_uid) = self.project_uid() else {
            log::warn!(target: "personalize", "personalization project uid is not configured");
            return Err(Error::NotConfigured);
        };

        let slot = self.current_slot();
        slot.get_or_init(|| self.initialize(project_uid))
            .await
            .clone()
    }

    /// The connection if it is already established. Never starts initialization.
    pub fn ready_connection(&self) -> Option<Arc<dyn Connection>> {
        match self.current_slot().get() {
            Some(Ok(connection)) => Some(connection.clone()),
            _ => None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        match self.current_slot().get() {
            Some(Ok(_)) => ConnectionState::Ready,
            Some(Err(_)) => ConnectionState::Failed,
            None if self.initializing.load(Ordering::SeqCst) => ConnectionState::Initializing,
            None => ConnectionState::Uninitialized,
        }
    }

    /// Allow a new initialization attempt after a cached failure.
    ///
    /// Returns `true` if the provider was in the failed state and has been reset. A ready or
    /// in-flight connection is left untouched.
    pub fn rearm(&self) -> bool {
        let mut slot = self
            .slot
            .lock()
            .expect("thread holding connection slot lock should not panic");
        if matches!(slot.get(), Some(Err(_))) {
            log::debug!(target: "personalize", "re-arming personalization connection after failure");
            *slot = Arc::new(OnceCell::new());
            true
        } else {
            false
        }
    }

    fn project_uid(&self) -> Option<String> {
        self.project_uid
            .read()
            .expect("thread holding project uid lock should not panic")
            .clone()
    }

    fn current_slot(&self) -> Slot {
        // Cloning the Arc under a short lock, so no lock is held while awaiting initialization.
        self.slot
            .lock()
            .expect("thread holding connection slot lock should not panic")
            .clone()
    }

    async fn initialize(&self, project_uid: String) -> Result<Arc<dyn Connection>> {
        let _in_flight = InFlight::enter(&self.initializing);

        log::debug!(target: "personalize", project_uid = project_uid.as_str(); "initializing personalization connection");
        let result = match tokio::time::timeout(self.init_timeout, self.client.init(&project_uid))
            .await
        {
            Ok(result) => result,
            Err(_elapsed) => Err(Error::Timeout),
        };

        match &result {
            Ok(_) => {
                log::debug!(target: "personalize", project_uid = project_uid.as_str(); "personalization connection ready")
            }
            Err(err) => {
                log::warn!(target: "personalize", project_uid = project_uid.as_str(); "failed to initialize personalization connection: {:?}", err)
            }
        }
        result
    }
}

/// Marks an initialization as in flight for as long as it lives, including when the initializing
/// future is dropped midway.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn enter(flag: &'a AtomicBool) -> InFlight<'a> {
        flag.store(true, Ordering::SeqCst);
        InFlight(flag)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
