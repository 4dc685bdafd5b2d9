//! Clone-and-extract worker, one invocation per repository.
//!
//! A worker:
//! 1. Reuses the repository's working tree if it exists, otherwise clones it
//! 2. Walks the tree and copies every file with the target suffix into the
//!    flat labeled-data directory, never overwriting an existing file
//! 3. Queues one [`LabelRecord`] per matched file, copied or not
//! 4. Reports to the completion barrier, whatever happened
//!
//! Files from different repositories that share a base name collide in the
//! output directory. The first copy wins; later repositories keep a record
//! that points at the first repository's bytes.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::harvest::barrier::{BarrierGuard, WorkerOutcome, WorkerStage};
use crate::harvest::traits::ExtractionError;
use crate::model::{LabelRecord, PendingLabel, RepositoryDescriptor};
use crate::traits::{CloneError, Cloner};

/// What happened to one matched file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopyResult {
    Copied,
    AlreadyExists,
}

/// Shared, read-only settings of every worker in a run.
#[derive(Clone)]
pub struct RepositoryWorker {
    cloner: Arc<dyn Cloner>,
    repo_root: PathBuf,
    output_dir: PathBuf,
    suffix: String,
    clone_timeout: Option<Duration>,
}

impl RepositoryWorker {
    /// `output_dir` must exist and be absolute; record file references are built from it.
    pub fn new(
        cloner: Arc<dyn Cloner>,
        repo_root: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        suffix: impl Into<String>,
    ) -> Self {
        Self {
            cloner,
            repo_root: repo_root.into(),
            output_dir: output_dir.into(),
            suffix: suffix.into(),
            clone_timeout: None,
        }
    }

    /// Bounds the clone step of each repository.
    pub fn with_clone_timeout(mut self, timeout: Duration) -> Self {
        self.clone_timeout = Some(timeout);
        self
    }

    pub fn checkout_path(&self, repository: &RepositoryDescriptor) -> PathBuf {
        self.repo_root.join(repository.checkout_dir_name())
    }

    /// Processes one repository and signals `guard` on return.
    #[instrument(
        skip_all,
        fields(id = repository.id, repository = %repository.checkout_dir_name())
    )]
    pub async fn run(
        &self,
        repository: RepositoryDescriptor,
        tx: mpsc::Sender<LabelRecord>,
        mut guard: BarrierGuard,
    ) {
        let cloned = match self.acquire(&repository).await {
            Ok(cloned) => cloned,
            Err(e) => {
                warn!(url = %repository.clone_url, error = %e, "Clone failed");
                guard.fail(WorkerStage::Clone, e.to_string(), 0);
                return;
            }
        };

        let (mut outcome, result) = self.extract(&repository, tx).await;
        outcome.cloned = cloned;

        match result {
            Ok(()) => {
                info!(
                    matched = outcome.files_matched,
                    copied = outcome.files_copied,
                    skipped = outcome.files_skipped_existing,
                    copy_failures = outcome.copy_failures,
                    "Repository extracted"
                );
                guard.succeed(outcome);
            }
            Err(e) => {
                warn!(
                    error = %e,
                    records_emitted = outcome.records_emitted,
                    "Extraction aborted"
                );
                guard.fail(WorkerStage::Extract, e.to_string(), outcome.records_emitted);
            }
        }
    }

    /// Ensures a complete working tree exists. Returns `true` if it was cloned now.
    ///
    /// The clone lands in a staging directory that is renamed into place on
    /// success, so an existing checkout directory is always complete.
    async fn acquire(&self, repository: &RepositoryDescriptor) -> Result<bool, CloneError> {
        let dest = self.checkout_path(repository);
        if tokio::fs::try_exists(&dest).await? {
            debug!(path = %dest.display(), "Reusing existing working tree");
            return Ok(false);
        }

        let staging = self
            .repo_root
            .join(format!(".{}.partial", repository.checkout_dir_name()));
        if tokio::fs::try_exists(&staging).await? {
            tokio::fs::remove_dir_all(&staging).await?;
        }
        tokio::fs::create_dir_all(&self.repo_root).await?;

        let clone = self
            .cloner
            .clone_repository(&repository.clone_url, &staging);
        let result = match self.clone_timeout {
            Some(limit) => tokio::time::timeout(limit, clone)
                .await
                .unwrap_or(Err(CloneError::Timeout(limit))),
            None => clone.await,
        };

        if let Err(e) = result {
            if let Err(cleanup) = tokio::fs::remove_dir_all(&staging).await {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    debug!(error = %cleanup, "Failed to remove staging directory");
                }
            }
            return Err(e);
        }

        tokio::fs::rename(&staging, &dest).await?;
        info!(path = %dest.display(), "Cloned repository");
        Ok(true)
    }

    async fn extract(
        &self,
        repository: &RepositoryDescriptor,
        tx: mpsc::Sender<LabelRecord>,
    ) -> (WorkerOutcome, Result<(), ExtractionError>) {
        let root = self.checkout_path(repository);
        let output_dir = self.output_dir.clone();
        let suffix = self.suffix.clone();
        let label = repository.pending_label();
        let mut outcome = WorkerOutcome {
            repository_id: repository.id,
            repository: repository.checkout_dir_name(),
            ..Default::default()
        };

        // The walk and copies are blocking; `blocking_send` gives the queue's backpressure.
        let span = tracing::Span::current();
        let task = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            let files = matching_files(&root, &suffix);
            let result = extract_files(files, &output_dir, &label, &tx, &mut outcome);
            (outcome, result)
        });

        match task.await {
            Ok(done) => done,
            Err(e) => (
                WorkerOutcome {
                    repository_id: repository.id,
                    repository: repository.checkout_dir_name(),
                    ..Default::default()
                },
                Err(ExtractionError::Task(e.to_string())),
            ),
        }
    }
}

/// Files under `root` whose name ends with `suffix`, in walk order.
///
/// `.git` is never entered and symlinks inside the tree are not followed.
fn matching_files<'a>(
    root: &'a Path,
    suffix: &'a str,
) -> impl Iterator<Item = Result<PathBuf, ExtractionError>> + 'a {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || entry.file_name() != ".git")
        .filter_map(move |entry| match entry {
            Ok(entry) => {
                let matched = entry.file_type().is_file()
                    && entry.file_name().to_string_lossy().ends_with(suffix);
                matched.then(|| Ok(entry.into_path()))
            }
            Err(e) => Some(Err(ExtractionError::Walk {
                path: e
                    .path()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| root.to_path_buf()),
                message: e.to_string(),
            })),
        })
}

/// Copies and labels each file. The first walk error stops the repository;
/// records already queued stay queued.
fn extract_files<I>(
    files: I,
    output_dir: &Path,
    label: &PendingLabel,
    tx: &mpsc::Sender<LabelRecord>,
    outcome: &mut WorkerOutcome,
) -> Result<(), ExtractionError>
where
    I: IntoIterator<Item = Result<PathBuf, ExtractionError>>,
{
    for file in files {
        let source = file?;
        let Some(file_name) = source.file_name() else {
            continue;
        };

        outcome.files_matched += 1;
        let dest = output_dir.join(file_name);

        match copy_new(&source, &dest) {
            Ok(CopyResult::Copied) => outcome.files_copied += 1,
            Ok(CopyResult::AlreadyExists) => {
                debug!(file = %dest.display(), "Skipping copy of existing file");
                outcome.files_skipped_existing += 1;
            }
            Err(e) => {
                warn!(source = %source.display(), error = %e, "Failed to copy file");
                outcome.copy_failures += 1;
                continue;
            }
        }

        tx.blocking_send(label.finish(dest))
            .map_err(|_| ExtractionError::QueueClosed)?;
        outcome.records_emitted += 1;
    }

    Ok(())
}

/// Copies `src` to `dest` unless `dest` already exists.
///
/// `dest` is created with create-new semantics, so concurrent workers racing
/// on one base name produce exactly one copy. A failed copy removes the
/// partially written file.
fn copy_new(src: &Path, dest: &Path) -> io::Result<CopyResult> {
    let mut out = match OpenOptions::new().write(true).create_new(true).open(dest) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Ok(CopyResult::AlreadyExists)
        }
        Err(e) => return Err(e),
    };

    let copied = File::open(src).and_then(|mut input| io::copy(&mut input, &mut out));
    if let Err(e) = copied {
        drop(out);
        let _ = fs::remove_file(dest);
        return Err(e);
    }
    Ok(CopyResult::Copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harvest::barrier::CompletionBarrier;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Materializes fixed file trees keyed by clone URL.
    struct FixtureCloner {
        trees: HashMap<String, Vec<(&'static str, &'static str)>>,
        clones: AtomicUsize,
    }

    impl FixtureCloner {
        fn new(trees: Vec<(&str, Vec<(&'static str, &'static str)>)>) -> Self {
            Self {
                trees: trees
                    .into_iter()
                    .map(|(url, files)| (url.to_string(), files))
                    .collect(),
                clones: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Cloner for FixtureCloner {
        async fn clone_repository(&self, url: &str, dest: &Path) -> Result<(), CloneError> {
            self.clones.fetch_add(1, Ordering::SeqCst);
            let files = self.trees.get(url).ok_or_else(|| CloneError::Failed {
                url: url.to_string(),
                message: "repository not found".to_string(),
            })?;
            for (path, contents) in files {
                let full = dest.join(path);
                fs::create_dir_all(full.parent().unwrap())?;
                fs::write(full, contents)?;
            }
            fs::create_dir_all(dest)?;
            Ok(())
        }
    }

    struct HangingCloner;

    #[async_trait]
    impl Cloner for HangingCloner {
        async fn clone_repository(&self, _url: &str, dest: &Path) -> Result<(), CloneError> {
            fs::create_dir_all(dest)?;
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    fn repo(id: u64, login: &str, name: &str) -> RepositoryDescriptor {
        RepositoryDescriptor {
            id,
            owner_id: id + 1000,
            owner_login: login.to_string(),
            name: name.to_string(),
            clone_url: format!("https://example.com/{}/{}.git", login, name),
        }
    }

    struct Workspace {
        _dir: tempfile::TempDir,
        repos: PathBuf,
        out: PathBuf,
    }

    fn workspace() -> Workspace {
        let dir = tempfile::tempdir().unwrap();
        let repos = dir.path().join("repos");
        let out = dir.path().join("labeled");
        fs::create_dir_all(&out).unwrap();
        let out = out.canonicalize().unwrap();
        Workspace {
            _dir: dir,
            repos,
            out,
        }
    }

    async fn run_one(
        worker: &RepositoryWorker,
        repository: RepositoryDescriptor,
    ) -> (Vec<LabelRecord>, crate::harvest::barrier::CompletionReport) {
        let barrier = CompletionBarrier::new(1);
        let (tx, mut rx) = mpsc::channel(64);
        let guard = barrier.arrival(repository.id, repository.checkout_dir_name());
        worker.run(repository, tx, guard).await;

        let mut records = Vec::new();
        while let Some(record) = rx.recv().await {
            records.push(record);
        }
        (records, barrier.wait().await)
    }

    #[tokio::test]
    async fn test_extracts_matching_files() {
        let ws = workspace();
        let cloner = Arc::new(FixtureCloner::new(vec![(
            "https://example.com/alice/demo.git",
            vec![
                ("src/foo.abap", "REPORT foo."),
                ("src/nested/bar.abap", "REPORT bar."),
                ("README.md", "# demo"),
                ("foo.abap.bak", "old"),
            ],
        )]));
        let worker = RepositoryWorker::new(cloner, &ws.repos, &ws.out, ".abap");

        let (records, report) = run_one(&worker, repo(42, "alice", "demo")).await;

        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.author_id == 1042 && r.project_id == 42));
        assert!(records.iter().all(|r| r.file_ref.starts_with(&ws.out)));
        assert_eq!(
            fs::read_to_string(ws.out.join("foo.abap")).unwrap(),
            "REPORT foo."
        );
        let outcome = &report.outcomes[0];
        assert!(outcome.cloned);
        assert_eq!(outcome.files_matched, 2);
        assert_eq!(outcome.files_copied, 2);
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn test_name_collision_keeps_first_copy_and_still_labels() {
        let ws = workspace();
        let cloner = Arc::new(FixtureCloner::new(vec![
            ("https://example.com/alice/one.git", vec![("util.abap", "first")]),
            ("https://example.com/bob/two.git", vec![("lib/util.abap", "second")]),
        ]));
        let worker = RepositoryWorker::new(cloner, &ws.repos, &ws.out, ".abap");

        let (first, _) = run_one(&worker, repo(1, "alice", "one")).await;
        let (second, report) = run_one(&worker, repo(2, "bob", "two")).await;

        assert_eq!(fs::read_to_string(ws.out.join("util.abap")).unwrap(), "first");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].project_id, 2);
        assert_eq!(second[0].file_ref, first[0].file_ref);
        assert_eq!(report.outcomes[0].files_skipped_existing, 1);
        assert_eq!(report.outcomes[0].files_copied, 0);
    }

    #[tokio::test]
    async fn test_existing_checkout_is_not_cloned_again() {
        let ws = workspace();
        let cloner = Arc::new(FixtureCloner::new(vec![(
            "https://example.com/alice/demo.git",
            vec![("a.abap", "a")],
        )]));
        let worker = RepositoryWorker::new(cloner.clone(), &ws.repos, &ws.out, ".abap");

        let (first, _) = run_one(&worker, repo(42, "alice", "demo")).await;
        let (second, report) = run_one(&worker, repo(42, "alice", "demo")).await;

        assert_eq!(cloner.clones.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
        assert!(!report.outcomes[0].cloned);
        assert_eq!(report.outcomes[0].files_skipped_existing, 1);
    }

    #[tokio::test]
    async fn test_clone_failure_is_reported_without_records() {
        let ws = workspace();
        let cloner = Arc::new(FixtureCloner::new(vec![]));
        let worker = RepositoryWorker::new(cloner, &ws.repos, &ws.out, ".abap");

        let (records, report) = run_one(&worker, repo(3, "carol", "gone")).await;

        assert!(records.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].stage, WorkerStage::Clone);
        assert!(!ws.repos.join("carol_gone").exists());
        assert!(!ws.repos.join(".carol_gone.partial").exists());
    }

    #[tokio::test]
    async fn test_stale_staging_directory_is_replaced() {
        let ws = workspace();
        let staging = ws.repos.join(".alice_demo.partial");
        fs::create_dir_all(&staging).unwrap();
        fs::write(staging.join("leftover.abap"), "partial").unwrap();

        let cloner = Arc::new(FixtureCloner::new(vec![(
            "https://example.com/alice/demo.git",
            vec![("fresh.abap", "fresh")],
        )]));
        let worker = RepositoryWorker::new(cloner, &ws.repos, &ws.out, ".abap");

        let (records, _) = run_one(&worker, repo(42, "alice", "demo")).await;

        assert_eq!(records.len(), 1);
        assert!(records[0].file_ref.ends_with("fresh.abap"));
        assert!(!staging.exists());
    }

    #[tokio::test]
    async fn test_clone_timeout_fails_only_this_repository() {
        let ws = workspace();
        let worker = RepositoryWorker::new(Arc::new(HangingCloner), &ws.repos, &ws.out, ".abap")
            .with_clone_timeout(Duration::from_millis(50));

        let (records, report) = run_one(&worker, repo(4, "dave", "slow")).await;

        assert!(records.is_empty());
        assert_eq!(report.failures[0].stage, WorkerStage::Clone);
        assert!(report.failures[0].message.contains("timed out after 50ms"));
        assert!(!ws.repos.join("dave_slow").exists());
    }

    fn drain(rx: &mut mpsc::Receiver<LabelRecord>) -> Vec<LabelRecord> {
        let mut records = Vec::new();
        while let Ok(record) = rx.try_recv() {
            records.push(record);
        }
        records
    }

    #[test]
    fn test_copy_failure_skips_file_and_continues() {
        let ws = workspace();
        let tree = ws.repos.join("tree");
        fs::create_dir_all(&tree).unwrap();
        fs::write(tree.join("kept.abap"), "kept").unwrap();
        let label = repo(5, "erin", "mixed").pending_label();
        let (tx, mut rx) = mpsc::channel(8);
        let mut outcome = WorkerOutcome::default();

        let files: Vec<Result<PathBuf, ExtractionError>> =
            vec![Ok(tree.join("vanished.abap")), Ok(tree.join("kept.abap"))];
        let result = extract_files(files, &ws.out, &label, &tx, &mut outcome);

        assert!(result.is_ok());
        let records = drain(&mut rx);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].file_ref, ws.out.join("kept.abap"));
        assert!(!ws.out.join("vanished.abap").exists());
        assert_eq!(outcome.files_matched, 2);
        assert_eq!(outcome.copy_failures, 1);
        assert_eq!(outcome.records_emitted, 1);
    }

    #[test]
    fn test_walk_error_stops_repository_but_keeps_queued_records() {
        let ws = workspace();
        let tree = ws.repos.join("tree");
        fs::create_dir_all(&tree).unwrap();
        fs::write(tree.join("before.abap"), "before").unwrap();
        fs::write(tree.join("after.abap"), "after").unwrap();
        let label = repo(6, "frank", "partial").pending_label();
        let (tx, mut rx) = mpsc::channel(8);
        let mut outcome = WorkerOutcome::default();

        let files: Vec<Result<PathBuf, ExtractionError>> = vec![
            Ok(tree.join("before.abap")),
            Err(ExtractionError::Walk {
                path: tree.join("locked"),
                message: "Permission denied".to_string(),
            }),
            Ok(tree.join("after.abap")),
        ];
        let result = extract_files(files, &ws.out, &label, &tx, &mut outcome);

        assert!(matches!(result, Err(ExtractionError::Walk { .. })));
        assert_eq!(drain(&mut rx).len(), 1);
        assert_eq!(outcome.records_emitted, 1);
        assert!(ws.out.join("before.abap").exists());
        assert!(!ws.out.join("after.abap").exists());
    }

    #[test]
    fn test_matching_files_skips_git_and_other_suffixes() {
        let ws = workspace();
        let tree = ws.repos.join("tree");
        fs::create_dir_all(tree.join(".git/objects")).unwrap();
        fs::create_dir_all(tree.join("src")).unwrap();
        fs::write(tree.join(".git/objects/hook.abap"), "x").unwrap();
        fs::write(tree.join("src/main.abap"), "x").unwrap();
        fs::write(tree.join("src/main.txt"), "x").unwrap();

        let files: Vec<PathBuf> = matching_files(&tree, ".abap")
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(files, vec![tree.join("src/main.abap")]);
    }

    /// Materializes a tree whose root cannot be walked for repositories named `broken`.
    #[cfg(unix)]
    struct UnwalkableCloner;

    #[cfg(unix)]
    #[async_trait]
    impl Cloner for UnwalkableCloner {
        async fn clone_repository(&self, url: &str, dest: &Path) -> Result<(), CloneError> {
            if url.ends_with("/broken.git") {
                std::os::unix::fs::symlink(dest.with_file_name("no-such-target"), dest)?;
            } else {
                fs::create_dir_all(dest)?;
                fs::write(dest.join("ok.abap"), "ok")?;
            }
            Ok(())
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_walk_failure_is_scoped_to_its_repository() {
        let ws = workspace();
        let worker = RepositoryWorker::new(Arc::new(UnwalkableCloner), &ws.repos, &ws.out, ".abap");
        let broken = repo(7, "gina", "broken");
        let healthy = repo(8, "hank", "healthy");

        let barrier = CompletionBarrier::new(2);
        let (tx, mut rx) = mpsc::channel(8);
        let broken_guard = barrier.arrival(broken.id, broken.checkout_dir_name());
        let healthy_guard = barrier.arrival(healthy.id, healthy.checkout_dir_name());
        tokio::join!(
            worker.run(broken, tx.clone(), broken_guard),
            worker.run(healthy, tx, healthy_guard),
        );
        let report = barrier.wait().await;

        let mut records = Vec::new();
        while let Some(record) = rx.recv().await {
            records.push(record);
        }
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].project_id, 8);

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].repository_id, 7);
        assert_eq!(report.failures[0].stage, WorkerStage::Extract);
        assert_eq!(report.failures[0].records_emitted, 0);
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].repository_id, 8);
        assert_eq!(report.outcomes[0].records_emitted, 1);
    }

    #[test]
    fn test_copy_new_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.abap");
        let dest = dir.path().join("dest.abap");
        fs::write(&src, "new").unwrap();
        fs::write(&dest, "old").unwrap();

        assert_eq!(copy_new(&src, &dest).unwrap(), CopyResult::AlreadyExists);
        assert_eq!(fs::read_to_string(&dest).unwrap(), "old");
    }

    #[test]
    fn test_copy_new_removes_partial_destination_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("dest.abap");

        assert!(copy_new(&dir.path().join("missing.abap"), &dest).is_err());
        assert!(!dest.exists());
    }
}
