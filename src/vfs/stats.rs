//! File metadata and open-flag parsing.

use serde::Serialize;

use super::error::{ErrorCode, FsError};

pub const S_IFMT: u32 = 0o170000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFLNK: u32 = 0o120000;

/// `fs.constants.COPYFILE_EXCL`
pub const COPYFILE_EXCL: u32 = 1;

const O_WRONLY: u32 = 0o1;
const O_RDWR: u32 = 0o2;
const O_CREAT: u32 = 0o100;
const O_EXCL: u32 = 0o200;
const O_TRUNC: u32 = 0o1000;
const O_APPEND: u32 = 0o2000;

/// The kind of a filesystem node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
    Symlink,
}

impl FileKind {
    pub fn type_bits(self) -> u32 {
        match self {
            FileKind::File => S_IFREG,
            FileKind::Directory => S_IFDIR,
            FileKind::Symlink => S_IFLNK,
        }
    }
}

/// A `stat` result, field-compatible with Node's `fs.Stats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime_ms: f64,
    pub mtime_ms: f64,
    pub ctime_ms: f64,
    pub birthtime_ms: f64,
}

impl Stats {
    pub fn kind(&self) -> FileKind {
        match self.mode & S_IFMT {
            S_IFDIR => FileKind::Directory,
            S_IFLNK => FileKind::Symlink,
            _ => FileKind::File,
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind() == FileKind::File
    }

    pub fn is_directory(&self) -> bool {
        self.kind() == FileKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind() == FileKind::Symlink
    }
}

/// Decoded `open(2)` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub exclusive: bool,
    pub truncate: bool,
    pub append: bool,
}

impl OpenFlags {
    pub const READ: OpenFlags = OpenFlags {
        read: true,
        write: false,
        create: false,
        exclusive: false,
        truncate: false,
        append: false,
    };

    pub const WRITE: OpenFlags = OpenFlags {
        read: false,
        write: true,
        create: true,
        exclusive: false,
        truncate: true,
        append: false,
    };

    pub const APPEND: OpenFlags = OpenFlags {
        read: false,
        write: true,
        create: true,
        exclusive: false,
        truncate: false,
        append: true,
    };

    /// Parse a Node flag string such as `"r"`, `"w+"` or `"ax"`.
    pub fn parse(flags: &str) -> Result<Self, FsError> {
        let invalid = || FsError::with_path(ErrorCode::InvalidArgument, "open", flags.to_string());
        let mut chars = flags.chars();
        let mut parsed = match chars.next() {
            Some('r') => OpenFlags::READ,
            Some('w') => OpenFlags::WRITE,
            Some('a') => OpenFlags::APPEND,
            _ => return Err(invalid()),
        };
        for c in chars {
            match c {
                '+' => {
                    parsed.read = true;
                    parsed.write = true;
                }
                'x' if parsed.create => parsed.exclusive = true,
                's' => {}
                _ => return Err(invalid()),
            }
        }
        Ok(parsed)
    }

    /// Decode numeric `O_*` bits.
    pub fn from_bits(bits: u32) -> Self {
        let access = bits & 0o3;
        OpenFlags {
            read: access != O_WRONLY,
            write: access == O_WRONLY || access == O_RDWR,
            create: bits & O_CREAT != 0,
            exclusive: bits & O_EXCL != 0,
            truncate: bits & O_TRUNC != 0,
            append: bits & O_APPEND != 0,
        }
    }
}
