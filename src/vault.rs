//! End-to-end vault operations
//!
//! A [`Vault`] runs one [`Request`] at a time per call, walking through the
//! stages `Idle -> ValidatingInputs -> DerivingKey -> Processing ->
//! Finalizing -> Succeeded | Failed`. Every failure leaves the filesystem as
//! it was before the call: output is only ever published by an atomic rename
//! in the final stage.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use zeroize::Zeroizing;

use crate::atomic::{self, AtomicFile};
use crate::cipher::{self, TAG_LEN};
use crate::config::VaultConfig;
use crate::container::{self, ContainerHeader, ContainerWriter, FORMAT_VERSION};
use crate::error::{ErrorKind, Result, VaultError};
use crate::kdf::{self, DerivedKeyMaterial, KdfCost};

// Outer messages for errors past input validation. Corrupt and unauthentic
// containers share them.
const DECRYPT_FAILED: &str = "failed to decrypt";
const VERIFY_FAILED: &str = "failed to verify";
const UPDATE_REJECTED: &str = "existing container does not open with this passphrase";

/// Where an operation currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    ValidatingInputs,
    DerivingKey,
    Processing,
    Finalizing,
    Succeeded,
    Failed(ErrorKind),
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Succeeded | Stage::Failed(_))
    }
}

/// Bytes processed so far in the current processing phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub processed: u64,
    pub total: u64,
}

impl Progress {
    /// Completed fraction in `0.0..=1.0`. An empty input counts as complete.
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.processed.min(self.total) as f64 / self.total as f64
        }
    }
}

/// Shared flag used to ask a running operation to stop.
///
/// The operation notices at the next chunk boundary or stage transition,
/// discards its temporary output and fails with [`ErrorKind::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Emits a notification each time progress crosses one of `steps` equal
/// steps of the total, so a phase produces at most `steps + 1` of them no
/// matter how many chunks it has.
#[derive(Debug)]
struct ProgressThrottle {
    steps: u32,
    total: u64,
    processed: u64,
    last_step: Option<u32>,
}

impl ProgressThrottle {
    fn new() -> Self {
        Self {
            steps: VaultConfig::DEFAULT_PROGRESS_STEPS,
            total: 0,
            processed: 0,
            last_step: None,
        }
    }

    fn begin(&mut self, total: u64, steps: u32) -> Option<Progress> {
        self.steps = steps;
        self.total = total;
        self.processed = 0;
        self.last_step = None;
        self.observe()
    }

    fn advance(&mut self, n: u64) -> Option<Progress> {
        self.processed = self.processed.saturating_add(n);
        self.observe()
    }

    fn step(&self) -> u32 {
        if self.total == 0 {
            return self.steps;
        }
        let done = u128::from(self.processed.min(self.total));
        (done * u128::from(self.steps) / u128::from(self.total)) as u32
    }

    fn observe(&mut self) -> Option<Progress> {
        let step = self.step();
        if self.last_step.is_some_and(|last| last >= step) {
            return None;
        }
        self.last_step = Some(step);
        Some(Progress {
            processed: self.processed,
            total: self.total,
        })
    }
}

/// Observes and steers a running operation: stage tracking, progress
/// notifications and cancellation.
pub struct Monitor<'a> {
    cancel: CancelToken,
    stage: Arc<Mutex<Stage>>,
    on_progress: Option<Box<dyn FnMut(Progress) + 'a>>,
    throttle: ProgressThrottle,
}

impl<'a> Monitor<'a> {
    pub fn new() -> Self {
        Self {
            cancel: CancelToken::new(),
            stage: Arc::new(Mutex::new(Stage::Idle)),
            on_progress: None,
            throttle: ProgressThrottle::new(),
        }
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Register a callback for progress notifications.
    pub fn on_progress(mut self, callback: impl FnMut(Progress) + 'a) -> Self {
        self.on_progress = Some(Box::new(callback));
        self
    }

    pub(crate) fn with_stage_cell(mut self, stage: Arc<Mutex<Stage>>) -> Self {
        self.stage = stage;
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn stage(&self) -> Stage {
        *self.stage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(&mut self, next: Stage) {
        let mut stage = self.stage.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::debug!(from = ?*stage, to = ?next, "stage transition");
        *stage = next;
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(VaultError::cancelled());
        }
        Ok(())
    }

    fn notify(&mut self, progress: Option<Progress>) {
        if let Some(progress) = progress {
            tracing::trace!(progress.processed, progress.total, "progress");
            if let Some(callback) = self.on_progress.as_mut() {
                callback(progress);
            }
        }
    }

    fn begin_phase(&mut self, total: u64, steps: u32) {
        let progress = self.throttle.begin(total, steps);
        self.notify(progress);
    }

    fn advance(&mut self, n: usize) -> Result<()> {
        let progress = self.throttle.advance(n as u64);
        self.notify(progress);
        self.checkpoint()
    }
}

impl Default for Monitor<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// An operation for the vault to carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Encrypt `source` into a new container at `destination`.
    Encrypt {
        source: PathBuf,
        destination: PathBuf,
    },
    /// Decrypt the container at `source` into `destination`.
    Decrypt {
        source: PathBuf,
        destination: PathBuf,
    },
    /// Check that the container at `source` opens with the passphrase,
    /// without writing any plaintext.
    Verify { source: PathBuf },
    /// Replace the contents of an existing container with `plaintext`, but
    /// only if the passphrase opens the existing container.
    Update {
        plaintext: PathBuf,
        container: PathBuf,
    },
}

impl Request {
    pub fn encrypt(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self::Encrypt {
            source: source.into(),
            destination: destination.into(),
        }
    }

    pub fn decrypt(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self::Decrypt {
            source: source.into(),
            destination: destination.into(),
        }
    }

    pub fn verify(source: impl Into<PathBuf>) -> Self {
        Self::Verify {
            source: source.into(),
        }
    }

    pub fn update(plaintext: impl Into<PathBuf>, container: impl Into<PathBuf>) -> Self {
        Self::Update {
            plaintext: plaintext.into(),
            container: container.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Request::Encrypt { .. } => "encrypt",
            Request::Decrypt { .. } => "decrypt",
            Request::Verify { .. } => "verify",
            Request::Update { .. } => "update",
        }
    }
}

/// Summary of a successful operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    /// Plaintext bytes encrypted, decrypted or verified.
    pub bytes_processed: u64,
    pub elapsed: Duration,
}

/// The encryption engine. Holds configuration only; every call owns its own
/// files and key material, so one `Vault` can serve any number of
/// concurrent operations on distinct files.
#[derive(Debug, Clone, Default)]
pub struct Vault {
    config: VaultConfig,
}

impl Vault {
    pub fn new(config: VaultConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    /// Run `request` to completion on the calling thread.
    ///
    /// The passphrase is wiped as soon as key derivation is done.
    pub fn run(
        &self,
        request: &Request,
        passphrase: Zeroizing<Vec<u8>>,
        monitor: &mut Monitor<'_>,
    ) -> Result<Report> {
        let started = Instant::now();
        let span = tracing::info_span!("vault", op = request.name());
        let _entered = span.enter();

        let result = match request {
            Request::Encrypt {
                source,
                destination,
            } => self.encrypt(source, destination, passphrase, monitor),
            Request::Decrypt {
                source,
                destination,
            } => self.decrypt(source, destination, passphrase, monitor),
            Request::Verify { source } => self.verify(source, passphrase, monitor),
            Request::Update {
                plaintext,
                container,
            } => self.update(plaintext, container, passphrase, monitor),
        };

        match result {
            Ok(bytes_processed) => {
                monitor.enter(Stage::Succeeded);
                let report = Report {
                    bytes_processed,
                    elapsed: started.elapsed(),
                };
                tracing::info!(
                    bytes = bytes_processed,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "operation succeeded"
                );
                Ok(report)
            }
            Err(e) => {
                monitor.enter(Stage::Failed(e.kind));
                // The caller reports the error itself.
                tracing::info!(kind = ?e.kind, error = %e, "operation failed");
                Err(e)
            }
        }
    }

    pub fn encrypt_file(
        &self,
        source: &Path,
        destination: &Path,
        passphrase: Zeroizing<Vec<u8>>,
        monitor: &mut Monitor<'_>,
    ) -> Result<Report> {
        self.run(&Request::encrypt(source, destination), passphrase, monitor)
    }

    pub fn decrypt_file(
        &self,
        source: &Path,
        destination: &Path,
        passphrase: Zeroizing<Vec<u8>>,
        monitor: &mut Monitor<'_>,
    ) -> Result<Report> {
        self.run(&Request::decrypt(source, destination), passphrase, monitor)
    }

    fn encrypt(
        &self,
        source: &Path,
        destination: &Path,
        passphrase: Zeroizing<Vec<u8>>,
        monitor: &mut Monitor<'_>,
    ) -> Result<u64> {
        monitor.enter(Stage::ValidatingInputs);
        let (plaintext, size) = open_source(source)?;
        check_destination(destination)?;
        check_distinct(source, destination)?;
        check_passphrase(&passphrase)?;
        monitor.checkpoint()?;

        monitor.enter(Stage::DerivingKey);
        let (header, keys) = fresh_keys(passphrase, size)?;
        monitor.checkpoint()?;

        monitor.enter(Stage::Processing);
        let writer = ContainerWriter::create(destination, &header)?;
        let (writer, tag) = self.seal(plaintext, writer, &header, &keys, monitor)?;

        monitor.enter(Stage::Finalizing);
        monitor.checkpoint()?;
        writer
            .finish(&tag)
            .map_err(|e| e.with_context(format!("failed to write to {}", destination.display())))?;
        Ok(size)
    }

    fn decrypt(
        &self,
        source: &Path,
        destination: &Path,
        passphrase: Zeroizing<Vec<u8>>,
        monitor: &mut Monitor<'_>,
    ) -> Result<u64> {
        monitor.enter(Stage::ValidatingInputs);
        drop(open_source(source)?);
        check_destination(destination)?;
        check_distinct(source, destination)?;
        check_passphrase(&passphrase)?;
        monitor.checkpoint()?;

        monitor.enter(Stage::DerivingKey);
        let mut opened = container::open(source).map_err(outer(DECRYPT_FAILED))?;
        let keys = derive_for(&opened.header, passphrase)?;
        monitor.checkpoint()?;

        monitor.enter(Stage::Processing);
        let size = opened.header.original_size;
        let mut out = AtomicFile::create(destination)?;
        monitor.begin_phase(size, self.config.progress_steps);
        cipher::decrypt_stream(
            &mut opened.ciphertext,
            &mut out,
            size,
            &keys,
            &opened.header.nonce,
            &opened.header_bytes,
            &opened.tag,
            self.config.chunk_size,
            &mut |n| monitor.advance(n),
        )
        .map_err(outer(DECRYPT_FAILED))?;

        monitor.enter(Stage::Finalizing);
        monitor.checkpoint()?;
        out.commit()
            .map_err(|e| e.with_context(format!("failed to write to {}", destination.display())))?;
        Ok(size)
    }

    fn verify(
        &self,
        source: &Path,
        passphrase: Zeroizing<Vec<u8>>,
        monitor: &mut Monitor<'_>,
    ) -> Result<u64> {
        monitor.enter(Stage::ValidatingInputs);
        drop(open_source(source)?);
        check_passphrase(&passphrase)?;
        monitor.checkpoint()?;

        monitor.enter(Stage::DerivingKey);
        let mut opened = container::open(source).map_err(outer(VERIFY_FAILED))?;
        let keys = derive_for(&opened.header, passphrase)?;
        monitor.checkpoint()?;

        monitor.enter(Stage::Processing);
        self.authenticate(&mut opened, &keys, monitor)
            .map_err(outer(VERIFY_FAILED))?;

        monitor.enter(Stage::Finalizing);
        Ok(opened.header.original_size)
    }

    fn update(
        &self,
        plaintext_path: &Path,
        container_path: &Path,
        passphrase: Zeroizing<Vec<u8>>,
        monitor: &mut Monitor<'_>,
    ) -> Result<u64> {
        monitor.enter(Stage::ValidatingInputs);
        let (plaintext, size) = open_source(plaintext_path)?;
        drop(open_source(container_path)?);
        check_destination(container_path)?;
        check_distinct(plaintext_path, container_path)?;
        check_passphrase(&passphrase)?;
        monitor.checkpoint()?;

        // Both key sets come from one passphrase read, so it can be wiped
        // before any content is processed.
        monitor.enter(Stage::DerivingKey);
        let mut existing = container::open(container_path).map_err(outer(UPDATE_REJECTED))?;
        let old_keys = derive_for(&existing.header, Zeroizing::new(passphrase.to_vec()))?;
        let (header, new_keys) = fresh_keys(passphrase, size)?;
        monitor.checkpoint()?;

        monitor.enter(Stage::Processing);
        self.authenticate(&mut existing, &old_keys, monitor)
            .map_err(outer(UPDATE_REJECTED))?;
        drop(existing);
        let writer = ContainerWriter::create(container_path, &header)?;
        let (writer, tag) = self.seal(plaintext, writer, &header, &new_keys, monitor)?;

        monitor.enter(Stage::Finalizing);
        monitor.checkpoint()?;
        writer.finish(&tag).map_err(|e| {
            e.with_context(format!("failed to write to {}", container_path.display()))
        })?;
        Ok(size)
    }

    /// Stream `plaintext` through the cipher into `writer`.
    fn seal(
        &self,
        plaintext: File,
        mut writer: ContainerWriter,
        header: &ContainerHeader,
        keys: &DerivedKeyMaterial,
        monitor: &mut Monitor<'_>,
    ) -> Result<(ContainerWriter, [u8; TAG_LEN])> {
        let size = header.original_size;
        let mut reader = BufReader::new(plaintext).take(size);
        monitor.begin_phase(size, self.config.progress_steps);
        let (tag, processed) = cipher::encrypt_stream(
            &mut reader,
            &mut writer,
            keys,
            &header.nonce,
            &header.to_bytes(),
            self.config.chunk_size,
            &mut |n| monitor.advance(n),
        )
        .map_err(|e| e.with_context("encryption failed"))?;

        let mut extra = [0u8; 1];
        let grew = reader
            .into_inner()
            .read(&mut extra)
            .map_err(|e| VaultError::io("failed to read plaintext", e))?
            > 0;
        if processed != size || grew {
            return Err(VaultError::new(
                ErrorKind::Io,
                "source file changed while it was being encrypted",
            ));
        }
        Ok((writer, tag))
    }

    /// Check the tag of an opened container without producing plaintext.
    fn authenticate<R: Read>(
        &self,
        opened: &mut container::OpenedContainer<R>,
        keys: &DerivedKeyMaterial,
        monitor: &mut Monitor<'_>,
    ) -> Result<()> {
        let size = opened.header.original_size;
        monitor.begin_phase(size, self.config.progress_steps);
        cipher::verify_stream(
            &mut opened.ciphertext,
            size,
            keys,
            &opened.header.nonce,
            &opened.header_bytes,
            &opened.tag,
            self.config.chunk_size,
            &mut |n| monitor.advance(n),
        )
    }
}

/// Attach an operation's outer message. Cancellation keeps its own.
fn outer(msg: &'static str) -> impl Fn(VaultError) -> VaultError {
    move |e| {
        if e.kind == ErrorKind::Cancelled {
            e
        } else {
            e.with_context(msg)
        }
    }
}

fn cost_for(version: u8) -> Result<KdfCost> {
    KdfCost::for_version(version).ok_or_else(|| {
        VaultError::new(
            ErrorKind::UnsupportedFormat,
            format!("unsupported container format version {}", version),
        )
    })
}

/// Generate salt and nonce for a new container and derive its keys.
fn fresh_keys(
    passphrase: Zeroizing<Vec<u8>>,
    size: u64,
) -> Result<(ContainerHeader, DerivedKeyMaterial)> {
    let header = ContainerHeader::new(kdf::generate_salt(), cipher::generate_nonce(), size);
    let keys = kdf::derive(&passphrase, &header.salt, cost_for(FORMAT_VERSION)?)?;
    Ok((header, keys))
}

/// Rebuild the keys of an existing container from its stored salt.
fn derive_for(header: &ContainerHeader, passphrase: Zeroizing<Vec<u8>>) -> Result<DerivedKeyMaterial> {
    kdf::derive(&passphrase, &header.salt, cost_for(header.version)?)
}

fn invalid_input(msg: String, err: io::Error) -> VaultError {
    VaultError::with_source(ErrorKind::InvalidInput, msg, err)
}

/// Open a regular file for reading and return it with its size.
fn open_source(path: &Path) -> Result<(File, u64)> {
    let file = File::open(path)
        .map_err(|e| invalid_input(format!("failed to read from {}", path.display()), e))?;
    let metadata = file
        .metadata()
        .map_err(|e| invalid_input(format!("failed to read from {}", path.display()), e))?;
    if !metadata.is_file() {
        return Err(VaultError::new(
            ErrorKind::InvalidInput,
            format!("{} is not a regular file", path.display()),
        ));
    }
    Ok((file, metadata.len()))
}

/// The destination must be creatable by rename inside an existing directory
/// this process can write to.
fn check_destination(path: &Path) -> Result<()> {
    if path.is_dir() {
        return Err(VaultError::new(
            ErrorKind::InvalidInput,
            format!("{} is a directory", path.display()),
        ));
    }
    let dir = atomic::parent_dir(path);
    let metadata = fs::metadata(dir).map_err(|e| {
        invalid_input(
            format!("destination directory {} is not accessible", dir.display()),
            e,
        )
    })?;
    if !metadata.is_dir() {
        return Err(VaultError::new(
            ErrorKind::InvalidInput,
            format!("{} is not a directory", dir.display()),
        ));
    }
    // Mode bits ignore ownership and read-only mounts. The anonymous scratch
    // file never shows up in the directory.
    tempfile::tempfile_in(dir).map_err(|e| match e.kind() {
        io::ErrorKind::PermissionDenied | io::ErrorKind::ReadOnlyFilesystem => invalid_input(
            format!("destination directory {} is not writable", dir.display()),
            e,
        ),
        _ => VaultError::io(
            format!("failed to test destination directory {}", dir.display()),
            e,
        ),
    })?;
    Ok(())
}

fn check_distinct(source: &Path, destination: &Path) -> Result<()> {
    if let (Ok(a), Ok(b)) = (fs::canonicalize(source), fs::canonicalize(destination)) {
        if a == b {
            return Err(VaultError::new(
                ErrorKind::InvalidInput,
                "source and destination must be different files",
            ));
        }
    }
    Ok(())
}

fn check_passphrase(passphrase: &[u8]) -> Result<()> {
    if passphrase.is_empty() {
        return Err(VaultError::new(
            ErrorKind::InvalidInput,
            "passphrase must not be empty",
        ));
    }
    Ok(())
}
