//! Content staging
//!
//! Turns whatever the user handed us (free text, a single file, or a
//! directory tree) into a fresh temporary directory that the static server
//! can use as its document root.

use crate::error::{Result, ShareError};
use std::fs::{self, File, FileTimes};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;
use tracing::{debug, info, warn};

/// Marker in the bundled template that is replaced with the shared text
pub const MESSAGE_MARKER: &str = "<% message %>";

/// Bundled HTML page used for text input
pub const INDEX_TEMPLATE: &str = include_str!("../assets/index.html");

/// File name written for text input
pub const INDEX_FILE: &str = "index.html";

const TEMP_PREFIX: &str = "tunshare-";

/// What the joined user input refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentInput {
    Text(String),
    SingleFile(PathBuf),
    Directory(PathBuf),
}

impl ContentInput {
    /// Existing directory wins, then existing file, everything else is text.
    /// Broken symlinks and special paths fall through to text.
    pub fn classify(raw: &str) -> Self {
        let path = Path::new(raw);
        if !raw.is_empty() && path.is_dir() {
            ContentInput::Directory(path.to_path_buf())
        } else if !raw.is_empty() && path.is_file() {
            ContentInput::SingleFile(path.to_path_buf())
        } else {
            ContentInput::Text(raw.to_string())
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ContentInput::Text(_) => "text",
            ContentInput::SingleFile(_) => "file",
            ContentInput::Directory(_) => "folder",
        }
    }
}

/// Join CLI tokens the way a shell user would expect: single spaces
pub fn join_tokens(tokens: &[String]) -> String {
    tokens.join(" ")
}

/// A uniquely named temp directory owned by this process.
///
/// `remove` deletes it explicitly and reports failures; if the value is
/// dropped without `remove`, the underlying `TempDir` still cleans up.
#[derive(Debug)]
pub struct StagedDir {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl StagedDir {
    pub fn create() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempdir()
            .map_err(|e| ShareError::fs(std::env::temp_dir(), e))?;
        let path = dir.path().to_path_buf();
        info!(path = %path.display(), "Created temporary directory");
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.dir.is_some() && self.path.is_dir()
    }

    /// Recursively delete the directory. Second and later calls are no-ops.
    pub fn remove(&mut self) -> Result<()> {
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };
        dir.close().map_err(|e| ShareError::fs(&self.path, e))?;
        info!(path = %self.path.display(), "Removed temporary directory");
        Ok(())
    }
}

/// Stages content into a fresh directory
#[derive(Debug, Clone)]
pub struct Stager {
    editor: String,
}

impl Stager {
    pub fn new(editor: impl Into<String>) -> Self {
        Self {
            editor: editor.into(),
        }
    }

    /// Stage the given tokens. Empty input opens the editor first.
    ///
    /// The returned directory is always new. On failure it is removed before
    /// the error is returned.
    pub fn stage(&self, tokens: &[String]) -> Result<StagedDir> {
        let mut staged = StagedDir::create()?;

        let mut content = join_tokens(tokens);
        if content.is_empty() {
            content = match read_from_editor(&self.editor) {
                Ok(text) => text,
                Err(e) => {
                    discard(&mut staged);
                    return Err(e);
                }
            };
        }

        let input = ContentInput::classify(&content);
        if let Err(e) = populate(staged.path(), &input) {
            discard(&mut staged);
            return Err(e);
        }

        Ok(staged)
    }
}

fn discard(staged: &mut StagedDir) {
    if let Err(e) = staged.remove() {
        warn!(error = %e, "Failed to remove temporary directory");
    }
}

/// Write `input` into `root`
pub fn populate(root: &Path, input: &ContentInput) -> Result<()> {
    match input {
        ContentInput::Directory(src) => {
            info!(path = %src.display(), "Detected folder input");
            copy_dir_contents(src, root)
        }
        ContentInput::SingleFile(src) => {
            info!(path = %src.display(), "Detected file input");
            let name = src.file_name().ok_or_else(|| {
                ShareError::fs(src, io::Error::new(io::ErrorKind::InvalidInput, "no file name"))
            })?;
            copy_file_with_metadata(src, &root.join(name))
        }
        ContentInput::Text(text) => {
            info!("Detected text input, creating index.html");
            let target = root.join(INDEX_FILE);
            fs::write(&target, render_template(text)).map_err(|e| ShareError::fs(&target, e))
        }
    }
}

/// Substitute `text` verbatim for every marker in the bundled template
pub fn render_template(text: &str) -> String {
    INDEX_TEMPLATE.replace(MESSAGE_MARKER, text)
}

/// Copy every entry of `src` into `dst`, recursing into subdirectories
pub fn copy_dir_contents(src: &Path, dst: &Path) -> Result<()> {
    let entries = fs::read_dir(src).map_err(|e| ShareError::fs(src, e))?;

    for entry in entries {
        let entry = entry.map_err(|e| ShareError::fs(src, e))?;
        let from = entry.path();
        let to = dst.join(entry.file_name());

        // follow symlinks, matching how the server will read them
        let meta = fs::metadata(&from).map_err(|e| ShareError::fs(&from, e))?;
        if meta.is_dir() {
            fs::create_dir(&to).map_err(|e| ShareError::fs(&to, e))?;
            copy_dir_contents(&from, &to)?;
            // after the children, which bump the directory's mtime
            copy_dir_metadata(&meta, &to)?;
        } else {
            copy_file_with_metadata(&from, &to)?;
        }
    }

    Ok(())
}

fn file_times(meta: &fs::Metadata) -> FileTimes {
    let mut times = FileTimes::new();
    if let Ok(modified) = meta.modified() {
        times = times.set_modified(modified);
    }
    if let Ok(accessed) = meta.accessed() {
        times = times.set_accessed(accessed);
    }
    times
}

/// Apply a source directory's timestamps, then its permissions, to `dst`
fn copy_dir_metadata(meta: &fs::Metadata, dst: &Path) -> Result<()> {
    // a read-only handle is enough to set times on a directory
    #[cfg(unix)]
    File::open(dst)
        .and_then(|f| f.set_times(file_times(meta)))
        .map_err(|e| ShareError::fs(dst, e))?;

    fs::set_permissions(dst, meta.permissions()).map_err(|e| ShareError::fs(dst, e))
}

/// Copy one file and carry over its permissions and timestamps
pub fn copy_file_with_metadata(src: &Path, dst: &Path) -> Result<()> {
    let meta = fs::metadata(src).map_err(|e| ShareError::fs(src, e))?;
    fs::copy(src, dst).map_err(|e| ShareError::fs(src, e))?;

    // fs::copy carries the mode, which may be read-only; open up long
    // enough to set the timestamps
    let mut writable = meta.permissions();
    #[allow(clippy::permissions_set_readonly_false)]
    writable.set_readonly(false);
    fs::set_permissions(dst, writable).map_err(|e| ShareError::fs(dst, e))?;

    File::options()
        .write(true)
        .open(dst)
        .and_then(|f| f.set_times(file_times(&meta)))
        .map_err(|e| ShareError::fs(dst, e))?;

    fs::set_permissions(dst, meta.permissions()).map_err(|e| ShareError::fs(dst, e))?;
    debug!(from = %src.display(), to = %dst.display(), "Copied file");
    Ok(())
}

/// Open an empty scratch file in `editor` and return what was saved
pub fn read_from_editor(editor: &str) -> Result<String> {
    let mut words = shell_words::split(editor)
        .map_err(|e| ShareError::Editor(format!("cannot parse editor command '{}': {}", editor, e)))?;
    if words.is_empty() {
        return Err(ShareError::Editor("editor command is empty".to_string()));
    }
    let program = words.remove(0);

    let scratch = tempfile::Builder::new()
        .prefix("share")
        .suffix(".txt")
        .tempfile()
        .map_err(|e| ShareError::fs(std::env::temp_dir(), e))?;

    info!(editor = %program, file = %scratch.path().display(), "Opening editor");
    let status = Command::new(&program)
        .args(&words)
        .arg(scratch.path())
        .status()
        .map_err(|e| ShareError::Editor(format!("failed to launch '{}': {}", program, e)))?;

    if !status.success() {
        return Err(ShareError::Editor(format!(
            "'{}' exited with {}",
            program, status
        )));
    }

    fs::read_to_string(scratch.path())
        .map_err(|e| ShareError::Editor(format!("cannot read {}: {}", scratch.path().display(), e)))
}
