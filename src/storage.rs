//! Durable commit storage: the store contract and built-in backends.

use std::collections::{HashMap, HashSet};
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

use crate::error::CommitError;
use crate::event::Commit;

/// Append-only durable storage for commits.
///
/// # Contract
///
/// - [`get_stream`](CommitStore::get_stream) returns the commits of a
///   stream with `version >= from_version`, ordered by version.
/// - [`save`](CommitStore::save) accepts a commit only at `head + 1`. A
///   commit whose `commit_id` is already stored in the stream fails with
///   [`CommitError::Duplicate`]; any other commit at a version that does not
///   follow the head fails with [`CommitError::Conflict`].
#[async_trait]
pub trait CommitStore: Send + Sync {
    async fn get_stream(
        &self,
        stream_id: Uuid,
        from_version: u64,
    ) -> Result<Vec<Commit>, CommitError>;

    async fn save(&self, commit: &Commit) -> Result<(), CommitError>;

    /// Delete every stream.
    async fn purge(&self) -> Result<(), CommitError>;
}

/// Decide whether `commit` may be appended to a stream at version `head`.
/// `stored` tells whether its commit id is already in the stream.
fn check_append(head: u64, stored: bool, commit: &Commit) -> Result<(), CommitError> {
    if stored {
        return Err(CommitError::Duplicate {
            stream_id: commit.stream_id,
            commit_id: commit.commit_id,
        });
    }
    if commit.version != head + 1 {
        return Err(CommitError::Conflict {
            stream_id: commit.stream_id,
            version: commit.version,
            head,
        });
    }
    Ok(())
}

/// Process-local commit store, for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemoryCommitStore {
    streams: Mutex<HashMap<Uuid, Vec<Commit>>>,
}

impl InMemoryCommitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of commits across all streams.
    pub fn len(&self) -> usize {
        let streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        streams.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CommitStore for InMemoryCommitStore {
    async fn get_stream(
        &self,
        stream_id: Uuid,
        from_version: u64,
    ) -> Result<Vec<Commit>, CommitError> {
        let streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(streams
            .get(&stream_id)
            .map(|commits| {
                commits
                    .iter()
                    .filter(|c| c.version >= from_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn save(&self, commit: &Commit) -> Result<(), CommitError> {
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        let stream = streams.entry(commit.stream_id).or_default();
        let head = stream.last().map_or(0, |c| c.version);
        let stored = stream.iter().any(|c| c.commit_id == commit.commit_id);
        check_append(head, stored, commit)?;
        stream.push(commit.clone());
        Ok(())
    }

    async fn purge(&self) -> Result<(), CommitError> {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }
}

/// Append position of one file-backed stream.
#[derive(Debug)]
struct StreamHead {
    version: u64,
    commit_ids: HashSet<Uuid>,
    /// Length of the file up to and including the last complete line.
    len: u64,
}

/// Commits parsed from a stream file, plus the byte length they cover.
struct StreamFile {
    commits: Vec<Commit>,
    len: u64,
}

impl StreamFile {
    /// Parse `bytes` as JSON lines. A final line with no trailing newline
    /// is an interrupted append and is left out.
    fn parse(stream_id: Uuid, bytes: &[u8]) -> Result<Self, CommitError> {
        let complete = bytes
            .iter()
            .rposition(|&b| b == b'\n')
            .map_or(0, |newline| newline + 1);
        if complete < bytes.len() {
            tracing::warn!(
                %stream_id,
                torn_bytes = bytes.len() - complete,
                "ignoring incomplete trailing commit line"
            );
        }

        let commits = bytes[..complete]
            .split(|&b| b == b'\n')
            .filter(|line| !line.trim_ascii().is_empty())
            .map(|line| serde_json::from_slice::<Commit>(line).map_err(CommitError::from))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            commits,
            len: complete as u64,
        })
    }

    fn head(&self) -> StreamHead {
        StreamHead {
            version: self.commits.last().map_or(0, |c| c.version),
            commit_ids: self.commits.iter().map(|c| c.commit_id).collect(),
            len: self.len,
        }
    }
}

/// File-backed commit store.
///
/// The layout follows this structure:
/// ```text
/// <base_dir>/
///     streams/
///         <stream_id>/
///             commits.jsonl   -- one JSON commit per line
/// ```
///
/// Appends are serialized through the lock on the stream heads, which is
/// what makes the head check and the append atomic within this process.
/// A stream file is parsed once per process for appending; after that its
/// head is tracked in memory. An incomplete last line left by an
/// interrupted append is ignored on read and cut off by the next append.
#[derive(Debug)]
pub struct FileCommitStore {
    base_dir: PathBuf,
    heads: tokio::sync::Mutex<HashMap<Uuid, StreamHead>>,
}

impl FileCommitStore {
    /// Create a store rooted at `base_dir`. The directory is created lazily
    /// on the first append.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            heads: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `<base_dir>/streams/<stream_id>/commits.jsonl`
    pub fn stream_path(&self, stream_id: Uuid) -> PathBuf {
        self.base_dir
            .join("streams")
            .join(stream_id.to_string())
            .join("commits.jsonl")
    }

    async fn read_stream(&self, stream_id: Uuid) -> Result<StreamFile, CommitError> {
        let path = self.stream_path(stream_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => StreamFile::parse(stream_id, &bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(StreamFile {
                commits: Vec::new(),
                len: 0,
            }),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write `line` at `head.len`, dropping whatever follows it.
async fn append_line(path: &Path, head: &StreamHead, line: &[u8]) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await?;
    if file.metadata().await?.len() != head.len {
        file.set_len(head.len).await?;
    }
    file.seek(SeekFrom::Start(head.len)).await?;
    file.write_all(line).await?;
    file.sync_data().await
}

#[async_trait]
impl CommitStore for FileCommitStore {
    async fn get_stream(
        &self,
        stream_id: Uuid,
        from_version: u64,
    ) -> Result<Vec<Commit>, CommitError> {
        let mut commits = self.read_stream(stream_id).await?.commits;
        commits.retain(|c| c.version >= from_version);
        Ok(commits)
    }

    async fn save(&self, commit: &Commit) -> Result<(), CommitError> {
        let mut heads = self.heads.lock().await;

        let mut head = match heads.remove(&commit.stream_id) {
            Some(head) => head,
            None => self.read_stream(commit.stream_id).await?.head(),
        };
        let checked = check_append(
            head.version,
            head.commit_ids.contains(&commit.commit_id),
            commit,
        );
        if let Err(e) = checked {
            heads.insert(commit.stream_id, head);
            return Err(e);
        }

        let mut line = serde_json::to_vec(commit)?;
        line.push(b'\n');

        // On failure the head stays uncached, so the next append re-reads
        // the file.
        let path = self.stream_path(commit.stream_id);
        append_line(&path, &head, &line).await?;

        head.version = commit.version;
        head.commit_ids.insert(commit.commit_id);
        head.len += line.len() as u64;
        heads.insert(commit.stream_id, head);
        Ok(())
    }

    async fn purge(&self) -> Result<(), CommitError> {
        let mut heads = self.heads.lock().await;
        heads.clear();
        match tokio::fs::remove_dir_all(self.base_dir.join("streams")).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
