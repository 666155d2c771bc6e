//! Background execution of vault operations
//!
//! [`Vault::spawn`] runs a request on its own worker thread so the caller
//! (a UI event loop, for instance) never blocks. Progress and completion
//! arrive through callbacks invoked on the worker thread; the returned
//! [`OperationHandle`] can cancel the operation or wait for it.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use zeroize::Zeroizing;

use crate::error::{ErrorCategory, ErrorKind, Result, VaultError};
use crate::vault::{CancelToken, Monitor, Progress, Report, Request, Stage, Vault};

pub struct OperationHandle {
    cancel: CancelToken,
    stage: Arc<Mutex<Stage>>,
    thread: JoinHandle<Result<Report>>,
}

impl OperationHandle {
    /// Ask the operation to stop. Has no effect once it has finalized.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn stage(&self) -> Stage {
        *self.stage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the operation and return its result.
    pub fn join(self) -> Result<Report> {
        self.thread.join().unwrap_or_else(|_| {
            Err(VaultError::with_category(
                ErrorCategory::Internal,
                ErrorKind::Io,
                "worker thread panicked",
            ))
        })
    }
}

impl Vault {
    /// Run `request` on a dedicated worker thread.
    ///
    /// `on_progress` receives throttled progress notifications and `on_done`
    /// receives the final result; both run on the worker thread. The same
    /// result is also returned by [`OperationHandle::join`].
    pub fn spawn<P, D>(
        &self,
        request: Request,
        passphrase: Zeroizing<Vec<u8>>,
        on_progress: P,
        on_done: D,
    ) -> Result<OperationHandle>
    where
        P: FnMut(Progress) + Send + 'static,
        D: FnOnce(&Result<Report>) + Send + 'static,
    {
        let cancel = CancelToken::new();
        let stage = Arc::new(Mutex::new(Stage::Idle));

        let vault = self.clone();
        let worker_cancel = cancel.clone();
        let worker_stage = Arc::clone(&stage);
        let thread = thread::Builder::new()
            .name(format!("filevault-{}", request.name()))
            .spawn(move || {
                let mut monitor = Monitor::new()
                    .with_cancel_token(worker_cancel)
                    .with_stage_cell(worker_stage)
                    .on_progress(on_progress);
                let result = vault.run(&request, passphrase, &mut monitor);
                on_done(&result);
                result
            })
            .map_err(|e| VaultError::io("failed to spawn worker thread", e))?;

        Ok(OperationHandle {
            cancel,
            stage,
            thread,
        })
    }

    pub fn spawn_encrypt<P, D>(
        &self,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        passphrase: Zeroizing<Vec<u8>>,
        on_progress: P,
        on_done: D,
    ) -> Result<OperationHandle>
    where
        P: FnMut(Progress) + Send + 'static,
        D: FnOnce(&Result<Report>) + Send + 'static,
    {
        self.spawn(
            Request::encrypt(source, destination),
            passphrase,
            on_progress,
            on_done,
        )
    }

    pub fn spawn_decrypt<P, D>(
        &self,
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        passphrase: Zeroizing<Vec<u8>>,
        on_progress: P,
        on_done: D,
    ) -> Result<OperationHandle>
    where
        P: FnMut(Progress) + Send + 'static,
        D: FnOnce(&Result<Report>) + Send + 'static,
    {
        self.spawn(
            Request::decrypt(source, destination),
            passphrase,
            on_progress,
            on_done,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::mpsc;
    use tempfile::TempDir;

    #[test]
    fn test_spawn_delivers_result_through_callback_and_join() {
        let temp_dir = TempDir::new().unwrap();
        let plain = temp_dir.path().join("plain.txt");
        let crypt = temp_dir.path().join("plain.txt.fv");
        fs::write(&plain, b"background").unwrap();

        let (tx, rx) = mpsc::channel();
        let handle = Vault::default()
            .spawn_encrypt(
                &plain,
                &crypt,
                Zeroizing::new(b"test".to_vec()),
                |_| {},
                move |result: &Result<Report>| {
                    tx.send(result.as_ref().map(|r| r.bytes_processed).ok())
                        .unwrap();
                },
            )
            .unwrap();

        let report = handle.join().unwrap();
        assert_eq!(report.bytes_processed, 10);
        assert_eq!(rx.recv().unwrap(), Some(10));
        assert!(crypt.exists());
    }

    #[test]
    fn test_handle_reports_terminal_stage() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing.fv");
        let out = temp_dir.path().join("out.txt");

        let handle = Vault::default()
            .spawn_decrypt(
                &missing,
                &out,
                Zeroizing::new(b"test".to_vec()),
                |_| {},
                |_: &Result<Report>| {},
            )
            .unwrap();

        assert!(!handle.cancel_token().is_cancelled());
        while !handle.is_finished() {
            thread::yield_now();
        }
        assert_eq!(handle.stage(), Stage::Failed(ErrorKind::InvalidInput));
        let err = handle.join().expect_err("missing source");
        assert_eq!(err.kind, ErrorKind::InvalidInput);
        assert!(!out.exists());
    }

    #[test]
    fn test_cancel_through_handle() {
        let temp_dir = TempDir::new().unwrap();
        let plain = temp_dir.path().join("plain.bin");
        let crypt = temp_dir.path().join("plain.bin.fv");
        fs::write(&plain, vec![3u8; 1024 * 1024]).unwrap();

        // Gate the worker on its first progress notification so the cancel
        // request is guaranteed to land mid-stream.
        let (started_tx, started_rx) = mpsc::channel();
        let (resume_tx, resume_rx) = mpsc::channel::<()>();
        let mut first = true;
        let handle = Vault::default()
            .spawn_encrypt(
                &plain,
                &crypt,
                Zeroizing::new(b"test".to_vec()),
                move |_| {
                    if first {
                        first = false;
                        started_tx.send(()).unwrap();
                        resume_rx.recv().unwrap();
                    }
                },
                |_: &Result<Report>| {},
            )
            .unwrap();

        started_rx.recv().unwrap();
        assert_eq!(handle.stage(), Stage::Processing);
        handle.cancel();
        resume_tx.send(()).unwrap();

        let err = handle.join().expect_err("expected cancellation");
        assert_eq!(err.kind, ErrorKind::Cancelled);
        assert!(!crypt.exists());
        assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 1);
    }
}
