//! External converter invocation.

use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::error::ErrorKind;

/// Errors that can occur while producing a preview.
#[derive(Debug, Error)]
pub enum PreviewError {
    /// The converter ran but exited unsuccessfully.
    #[error("converter failed for {output:?}: exit code {code:?}")]
    ConversionFailed {
        /// Preview that was not produced.
        output: PathBuf,
        /// Exit code, if the process was not killed by a signal.
        code: Option<i32>,
    },

    /// The converter process could not be started.
    #[error("failed to launch converter {shell:?}: {source}")]
    LaunchFailed {
        /// Shell used to run the script.
        shell: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The pipeline has been shut down.
    #[error("preview queue closed")]
    QueueClosed,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl PreviewError {
    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConversionFailed { .. } | Self::LaunchFailed { .. } => {
                ErrorKind::ConversionFailed
            }
            Self::QueueClosed | Self::Io(_) => ErrorKind::Internal,
        }
    }
}

/// Kind of media a preview is generated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    /// Still image; previewed as a JPEG thumbnail.
    Image,
    /// Video; previewed as a short MP4 clip.
    Video,
}

const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "webp", "tif", "tiff", "heic", "heif",
];
const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "m4v", "mov", "mkv", "webm", "avi", "wmv", "flv", "mpg", "mpeg", "3gp",
];

impl MediaKind {
    /// Picks the kind from the source file's extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Image)
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Video)
        } else {
            None
        }
    }

    /// Argument passed to the converter.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
        }
    }

    /// Extension of the generated preview.
    pub fn preview_extension(&self) -> &'static str {
        match self {
            Self::Image => "jpg",
            Self::Video => "mp4",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the preview of `virtual_path` is cached.
///
/// The preview extension is appended to the full source name so
/// `a.png` and `a.jpeg` never share a preview. Non-normal components
/// (`..`, `.`, the root) are dropped.
pub fn preview_output_path(cache_root: &Path, virtual_path: &str, kind: MediaKind) -> PathBuf {
    let mut out = cache_root.to_path_buf();
    for component in Path::new(virtual_path).components() {
        if let Component::Normal(part) = component {
            out.push(part);
        }
    }
    let mut name = out.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(kind.preview_extension());
    out.set_file_name(name);
    out
}

/// A single conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewRequest {
    /// Absolute source file.
    pub input: PathBuf,
    /// Absolute preview destination.
    pub output: PathBuf,
    /// What the source is.
    pub kind: MediaKind,
    /// Working directory of the converter.
    pub working_dir: PathBuf,
    /// Converter script.
    pub script: PathBuf,
}

/// The converter script and the directory it runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConverterScript {
    /// Script passed to the shell.
    pub path: PathBuf,
    /// Working directory; defaults to the script's directory.
    pub working_dir: PathBuf,
}

impl ConverterScript {
    /// Describes `path`, running in its own directory.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let working_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self { path, working_dir }
    }

    /// Overrides the working directory.
    pub fn with_working_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.working_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Builds a request converting `input` into `output`.
    pub fn request(&self, input: PathBuf, output: PathBuf, kind: MediaKind) -> PreviewRequest {
        PreviewRequest {
            input,
            output,
            kind,
            working_dir: self.working_dir.clone(),
            script: self.path.clone(),
        }
    }
}

/// Runs conversion requests through a shell.
#[derive(Debug, Clone)]
pub struct Converter {
    shell: PathBuf,
}

impl Converter {
    /// Creates a converter that runs scripts with `shell`.
    pub fn new<P: AsRef<Path>>(shell: P) -> Self {
        Self {
            shell: shell.as_ref().to_path_buf(),
        }
    }

    /// The shell used to run scripts.
    pub fn shell(&self) -> &Path {
        &self.shell
    }

    /// Runs `<shell> <script> <input> <output> <kind>` and waits for it.
    ///
    /// Standard output and error are inherited. Exit code 0 is the only
    /// success signal. The output's parent directory is created first.
    pub async fn run(&self, request: &PreviewRequest) -> Result<(), PreviewError> {
        if let Some(parent) = request.output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        debug!(
            "Converting {:?} -> {:?} ({})",
            request.input, request.output, request.kind
        );

        let status = Command::new(&self.shell)
            .arg(&request.script)
            .arg(&request.input)
            .arg(&request.output)
            .arg(request.kind.as_str())
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|source| PreviewError::LaunchFailed {
                shell: self.shell.clone(),
                source,
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(PreviewError::ConversionFailed {
                output: request.output.clone(),
                code: status.code(),
            })
        }
    }
}
