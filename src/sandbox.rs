use crate::tftp::ErrorCode;
use std::error;
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;

/// Why a requested filename cannot be served.
#[derive(Debug)]
pub enum SandboxError {
    AccessViolation(String),
    FileNotFound(String),
    FileAlreadyExists(String),
    Io(io::Error),
}

impl SandboxError {
    /// The wire error code reported to the requester.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            SandboxError::AccessViolation(_) => ErrorCode::AccessViolation,
            SandboxError::FileNotFound(_) => ErrorCode::FileNotFound,
            SandboxError::FileAlreadyExists(_) => ErrorCode::FileAlreadyExists,
            SandboxError::Io(e) => e.kind().into(),
        }
    }
}

impl error::Error for SandboxError {}

impl fmt::Display for SandboxError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SandboxError::AccessViolation(name) => write!(f, "'{}' resolves outside the root", name),
            SandboxError::FileNotFound(name) => write!(f, "'{}' does not exist", name),
            SandboxError::FileAlreadyExists(name) => write!(f, "'{}' already exists", name),
            SandboxError::Io(e) => write!(f, "filesystem error: {}", e),
        }
    }
}

impl From<io::Error> for SandboxError {
    fn from(e: io::Error) -> Self {
        SandboxError::Io(e)
    }
}

/// The directory a server exposes. Every requested name is resolved beneath it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    pub fn new(root: impl Into<PathBuf>) -> Sandbox {
        Sandbox { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Turns a wire filename into a relative path with no `..`, root or prefix components.
    ///
    /// A leading `/` is accepted and ignored, since many clients send absolute-looking names.
    fn relative(name: &str) -> Result<PathBuf, SandboxError> {
        let violation = || SandboxError::AccessViolation(name.to_string());
        if name.contains('\\') {
            return Err(violation());
        }

        let mut relative = PathBuf::new();
        for component in Path::new(name.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => return Err(violation()),
            }
        }
        if relative.as_os_str().is_empty() {
            return Err(violation());
        }
        Ok(relative)
    }

    /// Resolves a name for reading: it must exist, be a regular file, and, with symlinks
    /// followed, still live under the root.
    pub async fn resolve_read(&self, name: &str) -> Result<PathBuf, SandboxError> {
        let relative = Self::relative(name)?;
        let root = fs::canonicalize(&self.root).await?;

        let resolved = match fs::canonicalize(root.join(relative)).await {
            Ok(path) => path,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SandboxError::FileNotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        if !resolved.starts_with(&root) {
            return Err(SandboxError::AccessViolation(name.to_string()));
        }
        if !fs::metadata(&resolved).await?.is_file() {
            return Err(SandboxError::AccessViolation(name.to_string()));
        }
        Ok(resolved)
    }

    /// Resolves a name for writing: its directory must exist under the root, and the name
    /// itself must not be a directory or symlink. An existing file is refused unless
    /// `allow_overwrite` is set.
    pub async fn resolve_write(&self, name: &str, allow_overwrite: bool) -> Result<PathBuf, SandboxError> {
        let relative = Self::relative(name)?;
        let root = fs::canonicalize(&self.root).await?;
        let candidate = root.join(&relative);

        let (Some(parent), Some(file_name)) = (candidate.parent(), candidate.file_name()) else {
            return Err(SandboxError::AccessViolation(name.to_string()));
        };
        let parent = match fs::canonicalize(parent).await {
            Ok(path) => path,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SandboxError::FileNotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        if !parent.starts_with(&root) {
            return Err(SandboxError::AccessViolation(name.to_string()));
        }

        let target = parent.join(file_name);
        match fs::symlink_metadata(&target).await {
            Ok(meta) if meta.is_dir() || meta.file_type().is_symlink() => {
                Err(SandboxError::AccessViolation(name.to_string()))
            }
            Ok(_) if !allow_overwrite => Err(SandboxError::FileAlreadyExists(name.to_string())),
            Ok(_) => Ok(target),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(target),
            Err(e) => Err(e.into()),
        }
    }
}
