//! The Drive facade: sign-in lifecycle plus asynchronous storage operations.
//!
//! Every storage operation runs as a Tokio task on a bounded pool and reports
//! exactly once, both to the registered [`DriveListener`] and through the
//! [`OperationHandle`] returned to the caller. Failures are delivered the same
//! way as successes.
//!
//! # Example
//!
//! ```no_run
//! use drive_facade::{AuthorizationResponse, DriveConfig, DriveFacade};
//!
//! # async fn example(redirect: &str) -> drive_facade::Result<()> {
//! let facade = DriveFacade::google(DriveConfig::default())?;
//! let request = facade.request_sign_in()?;
//! println!("Open {}", request.authorization_url);
//!
//! let response = AuthorizationResponse::from_redirect_url(redirect)?;
//! facade.complete_sign_in(&request, &response).await?;
//!
//! let folder_id = facade.create_folder("Studies").wait().await?;
//! facade.create_file_in_folder(&folder_id, "/data", "scan.dcm").wait().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{OwnedMutexGuard, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::auth::{
    AuthorizationResponse, Credential, GoogleIdentityProvider, IdentityProvider, SignInRequest,
};
use crate::client::{DriveConnector, ServiceConnector, StorageApi, Upload};
use crate::config::DriveConfig;
use crate::error::{DriveError, Result};
use crate::models::{Account, NewEntry, RemoteEntry, DICOM_MIME_TYPE};

/// Receives the outcome of every facade operation.
///
/// All methods default to doing nothing, so implementors only override the
/// callbacks they care about. Callbacks run on worker tasks and must not block.
pub trait DriveListener: Send + Sync {
    fn on_signed_in(&self, _result: std::result::Result<&str, &DriveError>) {}

    fn on_file_created(&self, _result: std::result::Result<&str, &DriveError>) {}

    fn on_folder_created(&self, _result: std::result::Result<&str, &DriveError>) {}

    fn on_file_inserted_in_folder(&self, _result: std::result::Result<&str, &DriveError>) {}

    fn on_file_moved(&self, _result: std::result::Result<&str, &DriveError>) {}

    fn on_files_listed(&self, _result: std::result::Result<&[RemoteEntry], &DriveError>) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    CreateFile,
    CreateFolder,
    CreateFileInFolder,
    MoveFile,
    ListFiles,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::CreateFile => "create_file",
            OperationKind::CreateFolder => "create_folder",
            OperationKind::CreateFileInFolder => "create_file_in_folder",
            OperationKind::MoveFile => "move_file",
            OperationKind::ListFiles => "list_files",
        };
        f.write_str(name)
    }
}

/// Handle on an operation running in the background.
#[must_use = "dropping the handle detaches the operation; the listener still fires"]
pub struct OperationHandle<T> {
    kind: OperationKind,
    join: JoinHandle<Result<T>>,
    cancel: CancellationToken,
}

impl<T> OperationHandle<T> {
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Ask the operation to stop. It resolves with `DriveError::Cancelled`
    /// unless it already finished.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the operation's result.
    pub async fn wait(self) -> Result<T> {
        match self.join.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(DriveError::Cancelled),
            Err(e) => Err(DriveError::TaskFailed(e.to_string())),
        }
    }
}

/// A signed-in account and the service handle built for it.
struct Session {
    credential: Credential,
    service: Arc<dyn StorageApi>,
}

/// One async mutex per key, dropped once nobody holds or waits for it.
#[derive(Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<String, LockSlot>>,
}

#[derive(Default)]
struct LockSlot {
    mutex: Arc<tokio::sync::Mutex<()>>,
    /// Holders plus waiters.
    users: usize,
}

impl KeyedLocks {
    async fn lock(self: Arc<Self>, key: &str) -> KeyedGuard {
        let mutex = {
            let mut locks = self.locks.lock();
            let slot = locks.entry(key.to_string()).or_default();
            slot.users += 1;
            Arc::clone(&slot.mutex)
        };
        // Counted before waiting; a waiter dropped mid-wait releases its slot in Drop.
        let mut guard = KeyedGuard {
            owner: self,
            key: key.to_string(),
            guard: None,
        };
        guard.guard = Some(mutex.lock_owned().await);
        guard
    }
}

struct KeyedGuard {
    owner: Arc<KeyedLocks>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        let mut locks = self.owner.locks.lock();
        drop(self.guard.take());
        if let Some(slot) = locks.get_mut(&self.key) {
            slot.users -= 1;
            if slot.users == 0 {
                locks.remove(&self.key);
            }
        }
    }
}

struct Inner {
    config: DriveConfig,
    identity: Arc<dyn IdentityProvider>,
    connector: Arc<dyn ServiceConnector>,
    session: RwLock<Option<Arc<Session>>>,
    listener: RwLock<Option<Arc<dyn DriveListener>>>,
    limiter: Semaphore,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    move_locks: Arc<KeyedLocks>,
}

impl Inner {
    fn listener(&self) -> Option<Arc<dyn DriveListener>> {
        self.listener.read().clone()
    }

    async fn run<T, F, Fut>(
        &self,
        session: Option<Arc<Session>>,
        cancel: CancellationToken,
        op: F,
    ) -> Result<T>
    where
        F: FnOnce(Arc<dyn StorageApi>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let session = session.ok_or(DriveError::NotAuthenticated)?;
        let timeout = self.config.operation_timeout;

        let work = async {
            let Ok(_permit) = self.limiter.acquire().await else {
                return Err(DriveError::Cancelled);
            };
            match tokio::time::timeout(timeout, op(Arc::clone(&session.service))).await {
                Ok(result) => result,
                Err(_) => Err(DriveError::Timeout(timeout)),
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(DriveError::Cancelled),
            result = work => result,
        }
    }
}

/// Client-side orchestration over an identity provider and a Drive service.
///
/// Cheap to clone; clones share the session, the listener and the worker pool.
#[derive(Clone)]
pub struct DriveFacade {
    inner: Arc<Inner>,
}

impl DriveFacade {
    pub fn new(
        config: DriveConfig,
        identity: Arc<dyn IdentityProvider>,
        connector: Arc<dyn ServiceConnector>,
    ) -> Result<Self> {
        config.validate()?;
        let limiter = Semaphore::new(config.max_concurrent_operations);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                identity,
                connector,
                session: RwLock::new(None),
                listener: RwLock::new(None),
                limiter,
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                move_locks: Arc::new(KeyedLocks::default()),
            }),
        })
    }

    /// A facade wired to Google's identity provider and the Drive v3 API.
    pub fn google(config: DriveConfig) -> Result<Self> {
        let identity = Arc::new(GoogleIdentityProvider::new(config.clone()));
        let connector = Arc::new(DriveConnector::new(config.clone())?);
        Self::new(config, identity, connector)
    }

    pub fn config(&self) -> &DriveConfig {
        &self.inner.config
    }

    /// Register the listener. Replaces any previous one.
    pub fn set_listener(&self, listener: Arc<dyn DriveListener>) {
        *self.inner.listener.write() = Some(listener);
    }

    pub fn clear_listener(&self) {
        *self.inner.listener.write() = None;
    }

    pub fn is_signed_in(&self) -> bool {
        self.inner.session.read().is_some()
    }

    pub fn account(&self) -> Option<Account> {
        self.inner
            .session
            .read()
            .as_ref()
            .map(|s| s.credential.account().clone())
    }

    /// Credential of the current session, e.g. to persist its refresh token.
    pub fn credential(&self) -> Option<Credential> {
        self.inner
            .session
            .read()
            .as_ref()
            .map(|s| s.credential.clone())
    }

    /// Build the sign-in request the caller opens in the provider's UI.
    pub fn request_sign_in(&self) -> Result<SignInRequest> {
        self.inner.identity.sign_in_request()
    }

    /// Finish sign-in with the provider's redirect and install a new session.
    ///
    /// The listener's `on_signed_in` receives the account email or the error.
    /// A failed sign-in leaves any existing session in place.
    #[instrument(skip_all)]
    pub async fn complete_sign_in(
        &self,
        request: &SignInRequest,
        response: &AuthorizationResponse,
    ) -> Result<String> {
        let result = self
            .inner
            .identity
            .complete_sign_in(request, response)
            .await
            .map(|credential| self.install(credential));
        self.report_sign_in(&result);
        result
    }

    /// Rebuild a session from a refresh token issued by an earlier sign-in.
    #[instrument(skip_all)]
    pub async fn restore_session(&self, refresh_token: &str) -> Result<String> {
        let result = self
            .inner
            .identity
            .restore(refresh_token)
            .await
            .map(|credential| self.install(credential));
        self.report_sign_in(&result);
        result
    }

    fn install(&self, credential: Credential) -> String {
        let email = credential.account().email.clone();
        let service = self.inner.connector.connect(credential.clone());
        let previous = self
            .inner
            .session
            .write()
            .replace(Arc::new(Session {
                credential,
                service,
            }));
        if let Some(previous) = previous {
            debug!(
                previous = %previous.credential.account().email,
                "Replaced existing Drive session"
            );
        }
        email
    }

    fn report_sign_in(&self, result: &Result<String>) {
        match result {
            Ok(email) => info!(email = %email, "Drive session ready"),
            Err(e) => error!(error = %e, "Unable to sign in"),
        }
        if let Some(listener) = self.inner.listener() {
            listener.on_signed_in(result.as_deref());
        }
    }

    /// Drop the session and revoke its grant.
    ///
    /// Without a session this does nothing and succeeds. No listener callback
    /// fires either way. The session is cleared even when revocation fails.
    #[instrument(skip_all)]
    pub async fn sign_out(&self) -> Result<()> {
        let previous = self.inner.session.write().take();
        let credential = previous.as_ref().map(|s| &s.credential);

        if let Err(e) = self.inner.identity.sign_out(credential).await {
            warn!(error = %e, "Sign-out did not complete cleanly");
            return Err(e);
        }
        info!(had_session = previous.is_some(), "Signed out");
        Ok(())
    }

    /// Upload `directory/file_name` into the Drive root.
    pub fn create_file(
        &self,
        directory: impl AsRef<Path>,
        file_name: &str,
    ) -> OperationHandle<String> {
        let directory = directory.as_ref().to_path_buf();
        let file_name = file_name.to_string();
        self.dispatch(
            OperationKind::CreateFile,
            move |service| async move {
                let upload = Upload::open(&directory, &file_name).await?;
                let entry = service.create(NewEntry::file(file_name), Some(upload)).await?;
                Ok(entry.id)
            },
            |listener, result| listener.on_file_created(result.as_deref()),
        )
    }

    pub fn create_folder(&self, folder_name: &str) -> OperationHandle<String> {
        let folder_name = folder_name.to_string();
        self.dispatch(
            OperationKind::CreateFolder,
            move |service| async move {
                let entry = service.create(NewEntry::folder(folder_name), None).await?;
                Ok(entry.id)
            },
            |listener, result| listener.on_folder_created(result.as_deref()),
        )
    }

    /// Upload `directory/file_name` with `folder_id` as its only parent.
    pub fn create_file_in_folder(
        &self,
        folder_id: &str,
        directory: impl AsRef<Path>,
        file_name: &str,
    ) -> OperationHandle<String> {
        let folder_id = folder_id.to_string();
        let directory: PathBuf = directory.as_ref().to_path_buf();
        let file_name = file_name.to_string();
        self.dispatch(
            OperationKind::CreateFileInFolder,
            move |service| async move {
                let upload = Upload::open(&directory, &file_name).await?;
                let entry = NewEntry::file(file_name).in_folder(folder_id);
                let created = service.create(entry, Some(upload)).await?;
                Ok(created.id)
            },
            |listener, result| listener.on_file_inserted_in_folder(result.as_deref()),
        )
    }

    /// Make `target_folder_id` the only parent of `file_id`.
    ///
    /// Reads the current parents, then adds the target and removes the rest in
    /// one update. Moves of the same file through this facade never interleave.
    pub fn move_file(&self, target_folder_id: &str, file_id: &str) -> OperationHandle<String> {
        let target = target_folder_id.to_string();
        let file_id = file_id.to_string();
        let locks = Arc::clone(&self.inner.move_locks);
        self.dispatch(
            OperationKind::MoveFile,
            move |service| async move {
                let _guard = locks.lock(&file_id).await;
                move_to_folder(service.as_ref(), &target, &file_id).await
            },
            |listener, result| listener.on_file_moved(result.as_deref()),
        )
    }

    /// List every entry matching a Drive search query, following page tokens.
    pub fn list_files(&self, query: &str) -> OperationHandle<Vec<RemoteEntry>> {
        let query = query.to_string();
        self.dispatch(
            OperationKind::ListFiles,
            move |service| async move { list_all(service.as_ref(), &query).await },
            |listener, result| listener.on_files_listed(result.as_deref()),
        )
    }

    pub fn list_dicom_files(&self) -> OperationHandle<Vec<RemoteEntry>> {
        self.list_files(&dicom_query())
    }

    /// Cancel every running operation and wait for the pool to drain.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        debug!("Drive facade shut down");
    }

    fn dispatch<T, F, Fut, D>(&self, kind: OperationKind, op: F, deliver: D) -> OperationHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn StorageApi>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        D: FnOnce(&dyn DriveListener, &Result<T>) + Send + 'static,
    {
        let session = self.inner.session.read().clone();
        let cancel = self.inner.shutdown.child_token();
        let task_cancel = cancel.clone();
        let inner = Arc::clone(&self.inner);

        debug!(operation = %kind, "Dispatching operation");
        let join = self.inner.tracker.spawn(async move {
            let result = inner.run(session, task_cancel, op).await;
            match &result {
                Ok(_) => info!(operation = %kind, "Operation completed"),
                Err(e) => warn!(
                    operation = %kind,
                    error = %e,
                    transient = e.is_transient(),
                    "Operation failed"
                ),
            }
            if let Some(listener) = inner.listener() {
                deliver(listener.as_ref(), &result);
            }
            result
        });

        OperationHandle { kind, join, cancel }
    }
}

/// Drive search query matching DICOM files.
pub fn dicom_query() -> String {
    format!("mimeType='{}'", DICOM_MIME_TYPE)
}

async fn move_to_folder(service: &dyn StorageApi, target: &str, file_id: &str) -> Result<String> {
    let previous = service.get_parents(file_id).await?;
    let remove: Vec<String> = previous.into_iter().filter(|p| p != target).collect();
    debug!(file_id, target, removing = ?remove, "Moving file");

    let entry = service.update_parents(file_id, target, &remove).await?;
    Ok(entry.id)
}

async fn list_all(service: &dyn StorageApi, query: &str) -> Result<Vec<RemoteEntry>> {
    let mut entries = Vec::new();
    let mut page_token: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let page = service.list_page(query, page_token.as_deref()).await?;
        pages += 1;
        for entry in &page.files {
            info!(id = %entry.id, name = %entry.name, "Found file");
        }
        entries.extend(page.files);

        match page.next_page_token {
            Some(token) => page_token = Some(token),
            None => break,
        }
    }

    debug!(pages, count = entries.len(), "Listing complete");
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dicom_query() {
        assert_eq!(dicom_query(), "mimeType='application/dicom'");
    }

    #[test]
    fn test_operation_kind_display() {
        assert_eq!(OperationKind::MoveFile.to_string(), "move_file");
        assert_eq!(OperationKind::CreateFileInFolder.to_string(), "create_file_in_folder");
    }

    #[tokio::test]
    async fn test_keyed_locks_release_entries() {
        let locks = Arc::new(KeyedLocks::default());

        let first = Arc::clone(&locks).lock("file-1").await;
        assert_eq!(locks.locks.lock().len(), 1);
        drop(first);
        assert!(locks.locks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_keyed_locks_release_cancelled_waiter() {
        let locks = Arc::new(KeyedLocks::default());
        let holder = Arc::clone(&locks).lock("file-1").await;

        let mut waiter = Box::pin(Arc::clone(&locks).lock("file-1"));
        assert!(futures::poll!(waiter.as_mut()).is_pending());
        assert_eq!(locks.locks.lock()["file-1"].users, 2);

        drop(holder);
        drop(waiter);
        assert!(locks.locks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_keyed_locks_waiter_cancelled_before_holder_releases() {
        let locks = Arc::new(KeyedLocks::default());
        let holder = Arc::clone(&locks).lock("file-1").await;

        let mut waiter = Box::pin(Arc::clone(&locks).lock("file-1"));
        assert!(futures::poll!(waiter.as_mut()).is_pending());
        drop(waiter);
        assert_eq!(locks.locks.lock()["file-1"].users, 1);

        drop(holder);
        assert!(locks.locks.lock().is_empty());

        // The key is usable again afterwards.
        let _again = Arc::clone(&locks).lock("file-1").await;
        assert_eq!(locks.locks.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_keyed_locks_serialize_same_key() {
        let locks = Arc::new(KeyedLocks::default());
        let guard = Arc::clone(&locks).lock("file-1").await;

        let waiter = tokio::spawn({
            let locks = Arc::clone(&locks);
            async move {
                let _guard = locks.lock("file-1").await;
            }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        // Other keys are independent.
        let _other = Arc::clone(&locks).lock("file-2").await;

        drop(guard);
        waiter.await.unwrap();
    }
}
