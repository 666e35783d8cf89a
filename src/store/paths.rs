use std::fs;
use std::path::{Path, PathBuf};

pub(crate) const COMMIT_LOG_DIR: &str = "commitlog";
pub(crate) const CONSUME_QUEUE_DIR: &str = "consumequeue";
pub(crate) const TRANSACTION_DIR: &str = "transaction";
pub(crate) const TRANSACTION_STATE_DIR: &str = "statetable";
pub(crate) const CHECKPOINT_FILE: &str = "checkpoint";
pub(crate) const ABORT_FILE: &str = "abort";

/// Resolves every on-disk location of one store from its root directory.
#[derive(Debug, Clone)]
pub(crate) struct StorePaths {
    root: PathBuf,
}

impl StorePaths {
    pub(crate) fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn ensure_root(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.root)
    }

    pub(crate) fn commit_log_dir(&self) -> PathBuf {
        self.root.join(COMMIT_LOG_DIR)
    }

    pub(crate) fn consume_queue_root(&self) -> PathBuf {
        self.root.join(CONSUME_QUEUE_DIR)
    }

    pub(crate) fn consume_queue_dir(&self, topic: &str, queue_id: i32) -> PathBuf {
        self.consume_queue_root()
            .join(topic)
            .join(queue_id.to_string())
    }

    pub(crate) fn transaction_state_dir(&self) -> PathBuf {
        self.root.join(TRANSACTION_DIR).join(TRANSACTION_STATE_DIR)
    }

    pub(crate) fn checkpoint_path(&self) -> PathBuf {
        self.root.join(CHECKPOINT_FILE)
    }

    pub(crate) fn abort_path(&self) -> PathBuf {
        self.root.join(ABORT_FILE)
    }
}

/// Segment files are named by their absolute start offset, zero padded to 20 digits.
pub(crate) fn segment_file_name(start_offset: u64) -> String {
    format!("{:020}", start_offset)
}

pub(crate) fn parse_segment_file_name(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    if name.len() != 20 || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse::<u64>().ok()
}

/// Create a zero-filled segment file of `capacity` bytes and make both the
/// file and its directory entry durable.
pub(crate) fn create_segment_file(path: &Path, capacity: u64) -> std::io::Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    file.set_len(capacity)?;
    file.sync_all()?;

    // the file exists after a crash only once its directory entry is durable
    if let Some(parent) = path.parent() {
        fsync_dir(parent)?;
    }
    Ok(file)
}

pub(crate) fn fsync_dir(dir: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        fs::File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

/// Topics become directory names, so only a conservative alphabet is accepted.
pub(crate) fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= 127
        && topic
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'%' | b'|'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_names_round_trip() {
        let name = segment_file_name(1024);
        assert_eq!(name, "00000000000000001024");
        assert_eq!(parse_segment_file_name(Path::new(&name)), Some(1024));
        assert_eq!(parse_segment_file_name(Path::new("1024")), None);
        assert_eq!(parse_segment_file_name(Path::new("0000000000000000102x")), None);
    }

    #[test]
    fn topic_alphabet() {
        assert!(is_valid_topic("Topic_A-1"));
        assert!(is_valid_topic("%RETRY%group"));
        assert!(!is_valid_topic(""));
        assert!(!is_valid_topic("../etc"));
        assert!(!is_valid_topic(&"t".repeat(128)));
    }

    #[test]
    fn layout_under_root() {
        let paths = StorePaths::new(PathBuf::from("/data"));
        assert_eq!(paths.commit_log_dir(), PathBuf::from("/data/commitlog"));
        assert_eq!(
            paths.consume_queue_dir("T", 3),
            PathBuf::from("/data/consumequeue/T/3")
        );
        assert_eq!(paths.abort_path(), PathBuf::from("/data/abort"));
    }
}
