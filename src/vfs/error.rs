//! Node-style errno errors raised by the virtual filesystem.

use std::fmt;

/// The subset of POSIX error codes the volume produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotFound,
    AlreadyExists,
    NotADirectory,
    IsADirectory,
    DirectoryNotEmpty,
    BadDescriptor,
    InvalidArgument,
    TooManyLinks,
    PermissionDenied,
    NotPermitted,
    FileTooLarge,
    NoSpace,
}

impl ErrorCode {
    /// The symbolic code, e.g. `ENOENT`.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NotFound => "ENOENT",
            ErrorCode::AlreadyExists => "EEXIST",
            ErrorCode::NotADirectory => "ENOTDIR",
            ErrorCode::IsADirectory => "EISDIR",
            ErrorCode::DirectoryNotEmpty => "ENOTEMPTY",
            ErrorCode::BadDescriptor => "EBADF",
            ErrorCode::InvalidArgument => "EINVAL",
            ErrorCode::TooManyLinks => "ELOOP",
            ErrorCode::PermissionDenied => "EACCES",
            ErrorCode::NotPermitted => "EPERM",
            ErrorCode::FileTooLarge => "EFBIG",
            ErrorCode::NoSpace => "ENOSPC",
        }
    }

    /// Negative Linux errno, as Node reports it.
    pub fn errno(self) -> i32 {
        match self {
            ErrorCode::NotFound => -2,
            ErrorCode::AlreadyExists => -17,
            ErrorCode::NotADirectory => -20,
            ErrorCode::IsADirectory => -21,
            ErrorCode::DirectoryNotEmpty => -39,
            ErrorCode::BadDescriptor => -9,
            ErrorCode::InvalidArgument => -22,
            ErrorCode::TooManyLinks => -40,
            ErrorCode::PermissionDenied => -13,
            ErrorCode::NotPermitted => -1,
            ErrorCode::FileTooLarge => -27,
            ErrorCode::NoSpace => -28,
        }
    }

    fn description(self) -> &'static str {
        match self {
            ErrorCode::NotFound => "no such file or directory",
            ErrorCode::AlreadyExists => "file already exists",
            ErrorCode::NotADirectory => "not a directory",
            ErrorCode::IsADirectory => "illegal operation on a directory",
            ErrorCode::DirectoryNotEmpty => "directory not empty",
            ErrorCode::BadDescriptor => "bad file descriptor",
            ErrorCode::InvalidArgument => "invalid argument",
            ErrorCode::TooManyLinks => "too many symbolic links encountered",
            ErrorCode::PermissionDenied => "permission denied",
            ErrorCode::NotPermitted => "operation not permitted",
            ErrorCode::FileTooLarge => "file too large",
            ErrorCode::NoSpace => "no space left on device",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed filesystem call.
///
/// Displays like Node: `ENOENT: no such file or directory, open '/missing'`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsError {
    pub code: ErrorCode,
    pub syscall: &'static str,
    pub path: Option<String>,
    pub dest: Option<String>,
}

impl FsError {
    pub fn new(code: ErrorCode, syscall: &'static str) -> Self {
        Self {
            code,
            syscall,
            path: None,
            dest: None,
        }
    }

    pub fn with_path(code: ErrorCode, syscall: &'static str, path: impl Into<String>) -> Self {
        Self {
            code,
            syscall,
            path: Some(path.into()),
            dest: None,
        }
    }

    pub fn with_dest(mut self, dest: impl Into<String>) -> Self {
        self.dest = Some(dest.into());
        self
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}, {}", self.code, self.code.description(), self.syscall)?;
        if let Some(path) = &self.path {
            write!(f, " '{path}'")?;
        }
        if let Some(dest) = &self.dest {
            write!(f, " -> '{dest}'")?;
        }
        Ok(())
    }
}

impl std::error::Error for FsError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_matches_node() {
        let err = FsError::with_path(ErrorCode::NotFound, "open", "/missing.txt");
        assert_eq!(
            err.to_string(),
            "ENOENT: no such file or directory, open '/missing.txt'"
        );

        let err = FsError::with_path(ErrorCode::AlreadyExists, "link", "/a").with_dest("/b");
        assert_eq!(err.to_string(), "EEXIST: file already exists, link '/a' -> '/b'");

        let err = FsError::new(ErrorCode::BadDescriptor, "close");
        assert_eq!(err.to_string(), "EBADF: bad file descriptor, close");
    }
}
