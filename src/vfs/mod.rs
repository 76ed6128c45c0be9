//! In-memory virtual filesystem.
//!
//! A [`Volume`] is a tree of inodes (files, directories, symlinks) with
//! Node-compatible semantics for the operations the filesystem capability
//! exposes, plus a descriptor table for `open`/`read`/`write`. It is seeded
//! from a nested JSON description (`{"src": {"a.js": "..."}}`) and is shared
//! by `Arc` between the guest-facing capability and the module loader.

mod error;
pub mod path;
mod stats;

pub use error::{ErrorCode, FsError};
pub use stats::{FileKind, OpenFlags, Stats, COPYFILE_EXCL, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};

use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;

/// File descriptor handed out by [`Volume::open`].
pub type Fd = i32;

/// Result alias for filesystem calls.
pub type FsResult<T> = std::result::Result<T, FsError>;

type Ino = u64;

const ROOT: Ino = 1;
const FIRST_FD: Fd = 3;
const MAX_SYMLINK_HOPS: usize = 40;
const MKDTEMP_ATTEMPTS: usize = 64;
/// Largest size any single file may reach.
const MAX_FILE_SIZE: u64 = i32::MAX as u64;

fn now_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or_default()
}

#[derive(Debug)]
enum NodeKind {
    File(Vec<u8>),
    Directory(BTreeMap<String, Ino>),
    Symlink(String),
}

#[derive(Debug)]
struct Node {
    kind: NodeKind,
    perm: u32,
    uid: u32,
    gid: u32,
    nlink: u64,
    atime_ms: f64,
    mtime_ms: f64,
    ctime_ms: f64,
    birthtime_ms: f64,
}

impl Node {
    fn new(kind: NodeKind, perm: u32) -> Self {
        let now = now_ms();
        Self {
            kind,
            perm: perm & 0o7777,
            uid: 0,
            gid: 0,
            nlink: 1,
            atime_ms: now,
            mtime_ms: now,
            ctime_ms: now,
            birthtime_ms: now,
        }
    }

    fn file_kind(&self) -> FileKind {
        match self.kind {
            NodeKind::File(_) => FileKind::File,
            NodeKind::Directory(_) => FileKind::Directory,
            NodeKind::Symlink(_) => FileKind::Symlink,
        }
    }

    fn touch_modified(&mut self) {
        let now = now_ms();
        self.mtime_ms = now;
        self.ctime_ms = now;
    }

    fn touch_changed(&mut self) {
        self.ctime_ms = now_ms();
    }

    fn stats(&self, ino: Ino) -> Stats {
        let size = match &self.kind {
            NodeKind::File(data) => data.len() as u64,
            NodeKind::Directory(_) => 4096,
            NodeKind::Symlink(target) => target.len() as u64,
        };
        Stats {
            dev: 0,
            ino,
            mode: self.file_kind().type_bits() | self.perm,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            size,
            blksize: 4096,
            blocks: size.div_ceil(512),
            atime_ms: self.atime_ms,
            mtime_ms: self.mtime_ms,
            ctime_ms: self.ctime_ms,
            birthtime_ms: self.birthtime_ms,
        }
    }
}

#[derive(Debug)]
struct OpenFile {
    ino: Ino,
    flags: OpenFlags,
    position: u64,
}

#[derive(Debug)]
struct State {
    nodes: HashMap<Ino, Node>,
    next_ino: Ino,
    fds: BTreeMap<Fd, OpenFile>,
    next_fd: Fd,
    /// Bytes held by regular files.
    used: u64,
    /// Budget for `used`; `0` means unlimited.
    capacity: u64,
}

/// Callers must have charged `offset + bytes.len()` against the budget.
fn write_at(data: &mut Vec<u8>, offset: usize, bytes: &[u8]) {
    let end = offset + bytes.len();
    if data.len() < end {
        data.resize(end, 0);
    }
    data[offset..end].copy_from_slice(bytes);
}

impl State {
    fn new(capacity: u64) -> Self {
        let mut root = Node::new(NodeKind::Directory(BTreeMap::new()), 0o777);
        root.nlink = 2;
        let mut nodes = HashMap::new();
        nodes.insert(ROOT, root);
        Self {
            nodes,
            next_ino: ROOT + 1,
            fds: BTreeMap::new(),
            next_fd: FIRST_FD,
            used: 0,
            capacity,
        }
    }

    fn node(&self, ino: Ino) -> &Node {
        &self.nodes[&ino]
    }

    fn node_mut(&mut self, ino: Ino) -> &mut Node {
        self.nodes.get_mut(&ino).expect("dangling inode reference")
    }

    fn file_len(&self, ino: Ino) -> Option<usize> {
        match &self.node(ino).kind {
            NodeKind::File(data) => Some(data.len()),
            _ => None,
        }
    }

    /// Account for a file going from `old` to `new` bytes. Growth past the
    /// per-file limit or the volume budget is refused.
    fn charge(&mut self, old: usize, new: u64) -> Result<usize, ErrorCode> {
        if new > MAX_FILE_SIZE {
            return Err(ErrorCode::FileTooLarge);
        }
        let used = self.used.saturating_sub(old as u64) + new;
        if new > old as u64 && self.capacity > 0 && used > self.capacity {
            return Err(ErrorCode::NoSpace);
        }
        self.used = used;
        usize::try_from(new).map_err(|_| ErrorCode::FileTooLarge)
    }

    fn remove_node(&mut self, ino: Ino) {
        if let Some(Node {
            kind: NodeKind::File(data),
            ..
        }) = self.nodes.remove(&ino)
        {
            self.used = self.used.saturating_sub(data.len() as u64);
        }
    }

    fn insert_node(&mut self, node: Node) -> Ino {
        let ino = self.next_ino;
        self.next_ino += 1;
        self.nodes.insert(ino, node);
        ino
    }

    fn child(&self, dir: Ino, name: &str) -> Option<Ino> {
        match &self.node(dir).kind {
            NodeKind::Directory(entries) => entries.get(name).copied(),
            _ => None,
        }
    }

    fn entries_mut(&mut self, dir: Ino) -> Option<&mut BTreeMap<String, Ino>> {
        match &mut self.node_mut(dir).kind {
            NodeKind::Directory(entries) => Some(entries),
            _ => None,
        }
    }

    /// Walk `path` from the root, expanding symlinks. The last component is
    /// only followed when `follow_last` is set. Returns the inode and the
    /// canonical path that reached it.
    fn resolve(&self, path: &str, follow_last: bool, syscall: &'static str) -> FsResult<(Ino, String)> {
        let fail = |code| FsError::with_path(code, syscall, path);
        let mut current = path::normalize(path);
        let mut hops = 0;
        'walk: loop {
            let parts = path::components(&current);
            let mut ino = ROOT;
            let mut resolved: Vec<&str> = Vec::with_capacity(parts.len());
            for (idx, part) in parts.iter().enumerate() {
                let child = match &self.node(ino).kind {
                    NodeKind::Directory(entries) => entries
                        .get(part)
                        .copied()
                        .ok_or_else(|| fail(ErrorCode::NotFound))?,
                    _ => return Err(fail(ErrorCode::NotADirectory)),
                };
                let last = idx + 1 == parts.len();
                if let NodeKind::Symlink(target) = &self.node(child).kind {
                    if !last || follow_last {
                        hops += 1;
                        if hops > MAX_SYMLINK_HOPS {
                            return Err(fail(ErrorCode::TooManyLinks));
                        }
                        let base = format!("/{}", resolved.join("/"));
                        let mut next = path::join(&base, target);
                        for rest in &parts[idx + 1..] {
                            next.push('/');
                            next.push_str(rest);
                        }
                        current = next;
                        continue 'walk;
                    }
                }
                resolved.push(part);
                ino = child;
            }
            return Ok((ino, format!("/{}", resolved.join("/"))));
        }
    }

    /// Resolve the directory that would contain `path`, and the entry name.
    fn resolve_parent(&self, path: &str, syscall: &'static str) -> FsResult<(Ino, String, String)> {
        let normalized = path::normalize(path);
        let name = path::basename(&normalized);
        if name.is_empty() {
            return Err(FsError::with_path(ErrorCode::NotPermitted, syscall, path));
        }
        let (parent, parent_path) = self
            .resolve(&path::dirname(&normalized), true, syscall)
            .map_err(|e| FsError::with_path(e.code, syscall, path))?;
        if !matches!(self.node(parent).kind, NodeKind::Directory(_)) {
            return Err(FsError::with_path(ErrorCode::NotADirectory, syscall, path));
        }
        let canonical = path::join(&parent_path, &name);
        Ok((parent, name, canonical))
    }

    fn link_child(&mut self, parent: Ino, name: String, ino: Ino) {
        if let Some(entries) = self.entries_mut(parent) {
            entries.insert(name, ino);
        }
        self.node_mut(parent).touch_modified();
    }

    fn unlink_child(&mut self, parent: Ino, name: &str) -> Option<Ino> {
        let removed = self.entries_mut(parent).and_then(|entries| entries.remove(name));
        self.node_mut(parent).touch_modified();
        removed
    }

    /// Drop one link to `ino`, freeing it (and a directory's subtree) once
    /// nothing references it.
    fn release(&mut self, ino: Ino) {
        let node = self.node_mut(ino);
        node.nlink = node.nlink.saturating_sub(1);
        node.touch_changed();
        let children: Vec<Ino> = match &mut node.kind {
            NodeKind::Directory(entries) => std::mem::take(entries).into_values().collect(),
            _ => Vec::new(),
        };
        if matches!(node.kind, NodeKind::Directory(_)) {
            node.nlink = 0;
        }
        for child in children {
            self.release(child);
        }
        let open = self.fds.values().any(|file| file.ino == ino);
        if self.node(ino).nlink == 0 && !open {
            self.remove_node(ino);
        }
    }

    fn stat(&self, path: &str, follow: bool, syscall: &'static str) -> FsResult<Stats> {
        let (ino, _) = self.resolve(path, follow, syscall)?;
        Ok(self.node(ino).stats(ino))
    }

    fn open_file(&self, fd: Fd, syscall: &'static str) -> FsResult<&OpenFile> {
        self.fds
            .get(&fd)
            .ok_or_else(|| FsError::new(ErrorCode::BadDescriptor, syscall))
    }

    fn create_dir(&mut self, parent: Ino, name: String, mode: u32) -> Ino {
        let mut dir = Node::new(NodeKind::Directory(BTreeMap::new()), mode);
        dir.nlink = 2;
        let ino = self.insert_node(dir);
        self.link_child(parent, name, ino);
        ino
    }

    fn mkdir(&mut self, path: &str, recursive: bool, mode: u32) -> FsResult<Option<String>> {
        if !recursive {
            let (parent, name, _) = self.resolve_parent(path, "mkdir")?;
            if self.child(parent, &name).is_some() {
                return Err(FsError::with_path(ErrorCode::AlreadyExists, "mkdir", path));
            }
            self.create_dir(parent, name, mode);
            return Ok(None);
        }

        let parts = path::components(path);
        let mut first_created = None;
        let mut ino = ROOT;
        let mut so_far = String::new();
        for (idx, part) in parts.iter().enumerate() {
            so_far.push('/');
            so_far.push_str(part);
            let last = idx + 1 == parts.len();
            match self.resolve(&so_far, true, "mkdir") {
                Ok((existing, _)) => {
                    if !matches!(self.node(existing).kind, NodeKind::Directory(_)) {
                        let code = if last {
                            ErrorCode::AlreadyExists
                        } else {
                            ErrorCode::NotADirectory
                        };
                        return Err(FsError::with_path(code, "mkdir", path));
                    }
                    ino = existing;
                }
                Err(e) if e.code == ErrorCode::NotFound => {
                    if self.child(ino, part).is_some() {
                        return Err(FsError::with_path(ErrorCode::AlreadyExists, "mkdir", path));
                    }
                    ino = self.create_dir(ino, part.clone(), mode);
                    first_created.get_or_insert_with(|| so_far.clone());
                }
                Err(e) => return Err(FsError::with_path(e.code, "mkdir", path)),
            }
        }
        Ok(first_created)
    }

    fn rmdir(&mut self, path: &str, recursive: bool) -> FsResult<()> {
        let fail = |code| FsError::with_path(code, "rmdir", path);
        let (ino, canonical) = self.resolve(path, false, "rmdir")?;
        if ino == ROOT {
            return Err(fail(ErrorCode::NotPermitted));
        }
        match &self.node(ino).kind {
            NodeKind::Directory(entries) if !entries.is_empty() && !recursive => {
                return Err(fail(ErrorCode::DirectoryNotEmpty));
            }
            NodeKind::Directory(_) => {}
            _ => return Err(fail(ErrorCode::NotADirectory)),
        }
        let (parent, name, _) = self.resolve_parent(&canonical, "rmdir")?;
        self.unlink_child(parent, &name);
        self.release(ino);
        Ok(())
    }

    fn readdir(&self, path: &str) -> FsResult<Vec<String>> {
        let (ino, _) = self.resolve(path, true, "scandir")?;
        match &self.node(ino).kind {
            NodeKind::Directory(entries) => Ok(entries.keys().cloned().collect()),
            _ => Err(FsError::with_path(ErrorCode::NotADirectory, "scandir", path)),
        }
    }

    /// Open-or-create semantics shared by `open`, `readFile` and `writeFile`.
    fn open_node(&mut self, path: &str, flags: OpenFlags, mode: u32) -> FsResult<Ino> {
        match self.resolve(path, true, "open") {
            Ok((ino, _)) => {
                if flags.create && flags.exclusive {
                    return Err(FsError::with_path(ErrorCode::AlreadyExists, "open", path));
                }
                if flags.write && matches!(self.node(ino).kind, NodeKind::Directory(_)) {
                    return Err(FsError::with_path(ErrorCode::IsADirectory, "open", path));
                }
                if flags.write && flags.truncate {
                    if let Some(old) = self.file_len(ino) {
                        self.used = self.used.saturating_sub(old as u64);
                    }
                    let node = self.node_mut(ino);
                    if let NodeKind::File(data) = &mut node.kind {
                        data.clear();
                    }
                    node.touch_modified();
                }
                Ok(ino)
            }
            Err(e) if e.code == ErrorCode::NotFound && flags.create => {
                let (parent, name, _) = self.resolve_parent(path, "open")?;
                if self.child(parent, &name).is_some() {
                    return Err(e);
                }
                let ino = self.insert_node(Node::new(NodeKind::File(Vec::new()), mode));
                self.link_child(parent, name, ino);
                Ok(ino)
            }
            Err(e) => Err(e),
        }
    }

    fn read_file(&mut self, path: &str, flags: OpenFlags) -> FsResult<Vec<u8>> {
        let ino = self.open_node(path, flags, 0o666)?;
        let node = self.node_mut(ino);
        match &node.kind {
            NodeKind::File(data) => {
                let data = data.clone();
                node.atime_ms = now_ms();
                Ok(data)
            }
            _ => Err(FsError::with_path(ErrorCode::IsADirectory, "read", path)),
        }
    }

    fn write_file(&mut self, path: &str, bytes: &[u8], flags: OpenFlags, mode: u32) -> FsResult<()> {
        let ino = self.open_node(path, flags, mode)?;
        let Some(old) = self.file_len(ino) else {
            return Err(FsError::with_path(ErrorCode::IsADirectory, "open", path));
        };
        let new = if flags.append {
            old as u64 + bytes.len() as u64
        } else if flags.truncate {
            bytes.len() as u64
        } else {
            old.max(bytes.len()) as u64
        };
        self.charge(old, new)
            .map_err(|code| FsError::with_path(code, "write", path))?;
        let node = self.node_mut(ino);
        if let NodeKind::File(data) = &mut node.kind {
            if flags.append {
                data.extend_from_slice(bytes);
            } else if flags.truncate {
                *data = bytes.to_vec();
            } else {
                write_at(data, 0, bytes);
            }
        }
        node.touch_modified();
        Ok(())
    }

    fn truncate_node(&mut self, ino: Ino, len: u64, path: Option<&str>, syscall: &'static str) -> FsResult<()> {
        let fail = |code| match path {
            Some(path) => FsError::with_path(code, syscall, path),
            None => FsError::new(code, syscall),
        };
        let Some(old) = self.file_len(ino) else {
            let code = match path {
                Some(_) => ErrorCode::IsADirectory,
                None => ErrorCode::InvalidArgument,
            };
            return Err(fail(code));
        };
        let len = self.charge(old, len).map_err(fail)?;
        let node = self.node_mut(ino);
        if let NodeKind::File(data) = &mut node.kind {
            data.resize(len, 0);
        }
        node.touch_modified();
        Ok(())
    }

    fn copy_file(&mut self, src: &str, dest: &str, mode: u32) -> FsResult<()> {
        let fail = |code| FsError::with_path(code, "copyfile", src).with_dest(dest);
        let (ino, _) = self.resolve(src, true, "copyfile").map_err(|e| fail(e.code))?;
        let node = self.node(ino);
        let NodeKind::File(data) = &node.kind else {
            return Err(fail(ErrorCode::IsADirectory));
        };
        let (data, perm) = (data.clone(), node.perm);
        let flags = OpenFlags {
            exclusive: mode & COPYFILE_EXCL != 0,
            ..OpenFlags::WRITE
        };
        self.write_file(dest, &data, flags, perm)
            .map_err(|e| fail(e.code))
    }

    fn rename(&mut self, old: &str, new: &str) -> FsResult<()> {
        let fail = |code| FsError::with_path(code, "rename", old).with_dest(new);
        let (src, src_path) = self.resolve(old, false, "rename").map_err(|e| fail(e.code))?;
        if src == ROOT {
            return Err(fail(ErrorCode::NotPermitted));
        }
        let (src_parent, src_name, _) = self.resolve_parent(&src_path, "rename").map_err(|e| fail(e.code))?;
        let (dst_parent, dst_name, dst_path) = self.resolve_parent(new, "rename").map_err(|e| fail(e.code))?;
        let src_is_dir = matches!(self.node(src).kind, NodeKind::Directory(_));
        if src_is_dir && dst_path.starts_with(&format!("{src_path}/")) {
            return Err(fail(ErrorCode::InvalidArgument));
        }

        if let Some(existing) = self.child(dst_parent, &dst_name) {
            if existing == src {
                return Ok(());
            }
            match (&self.node(existing).kind, src_is_dir) {
                (NodeKind::Directory(entries), true) if !entries.is_empty() => {
                    return Err(fail(ErrorCode::DirectoryNotEmpty));
                }
                (NodeKind::Directory(_), true) => {}
                (_, true) => return Err(fail(ErrorCode::NotADirectory)),
                (NodeKind::Directory(_), false) => return Err(fail(ErrorCode::IsADirectory)),
                _ => {}
            }
            self.unlink_child(dst_parent, &dst_name);
            self.release(existing);
        }

        self.unlink_child(src_parent, &src_name);
        self.link_child(dst_parent, dst_name, src);
        self.node_mut(src).touch_changed();
        Ok(())
    }

    fn unlink(&mut self, path: &str) -> FsResult<()> {
        let (ino, canonical) = self.resolve(path, false, "unlink")?;
        if matches!(self.node(ino).kind, NodeKind::Directory(_)) {
            return Err(FsError::with_path(ErrorCode::IsADirectory, "unlink", path));
        }
        let (parent, name, _) = self.resolve_parent(&canonical, "unlink")?;
        self.unlink_child(parent, &name);
        self.release(ino);
        Ok(())
    }

    fn link(&mut self, existing: &str, new: &str) -> FsResult<()> {
        let fail = |code| FsError::with_path(code, "link", existing).with_dest(new);
        let (ino, _) = self.resolve(existing, false, "link").map_err(|e| fail(e.code))?;
        if matches!(self.node(ino).kind, NodeKind::Directory(_)) {
            return Err(fail(ErrorCode::NotPermitted));
        }
        let (parent, name, _) = self.resolve_parent(new, "link").map_err(|e| fail(e.code))?;
        if self.child(parent, &name).is_some() {
            return Err(fail(ErrorCode::AlreadyExists));
        }
        self.link_child(parent, name, ino);
        let node = self.node_mut(ino);
        node.nlink += 1;
        node.touch_changed();
        Ok(())
    }

    fn symlink(&mut self, target: &str, path: &str) -> FsResult<()> {
        let fail = |code| FsError::with_path(code, "symlink", target).with_dest(path);
        let (parent, name, _) = self.resolve_parent(path, "symlink").map_err(|e| fail(e.code))?;
        if self.child(parent, &name).is_some() {
            return Err(fail(ErrorCode::AlreadyExists));
        }
        let ino = self.insert_node(Node::new(NodeKind::Symlink(target.to_string()), 0o777));
        self.link_child(parent, name, ino);
        Ok(())
    }

    fn readlink(&self, path: &str) -> FsResult<String> {
        let (ino, _) = self.resolve(path, false, "readlink")?;
        match &self.node(ino).kind {
            NodeKind::Symlink(target) => Ok(target.clone()),
            _ => Err(FsError::with_path(ErrorCode::InvalidArgument, "readlink", path)),
        }
    }

    fn open(&mut self, path: &str, flags: OpenFlags, mode: u32) -> FsResult<Fd> {
        let ino = self.open_node(path, flags, mode)?;
        let fd = self.next_fd;
        self.next_fd += 1;
        self.fds.insert(
            fd,
            OpenFile {
                ino,
                flags,
                position: 0,
            },
        );
        Ok(fd)
    }

    fn close(&mut self, fd: Fd) -> FsResult<()> {
        let file = self
            .fds
            .remove(&fd)
            .ok_or_else(|| FsError::new(ErrorCode::BadDescriptor, "close"))?;
        let still_open = self.fds.values().any(|other| other.ino == file.ino);
        if !still_open && self.node(file.ino).nlink == 0 {
            self.remove_node(file.ino);
        }
        Ok(())
    }

    fn read_fd(&mut self, fd: Fd, length: usize, position: Option<u64>) -> FsResult<Vec<u8>> {
        let (ino, flags, cursor) = {
            let file = self.open_file(fd, "read")?;
            (file.ino, file.flags, file.position)
        };
        if !flags.read {
            return Err(FsError::new(ErrorCode::BadDescriptor, "read"));
        }
        let data = match &self.node(ino).kind {
            NodeKind::File(data) => data,
            _ => return Err(FsError::new(ErrorCode::IsADirectory, "read")),
        };
        let start = usize::try_from(position.unwrap_or(cursor)).unwrap_or(usize::MAX);
        let chunk = if start >= data.len() {
            Vec::new()
        } else {
            data[start..data.len().min(start.saturating_add(length))].to_vec()
        };
        if position.is_none() {
            if let Some(file) = self.fds.get_mut(&fd) {
                file.position += chunk.len() as u64;
            }
        }
        Ok(chunk)
    }

    fn write_fd(&mut self, fd: Fd, bytes: &[u8], position: Option<u64>) -> FsResult<usize> {
        let (ino, flags, cursor) = {
            let file = self.open_file(fd, "write")?;
            (file.ino, file.flags, file.position)
        };
        if !flags.write {
            return Err(FsError::new(ErrorCode::BadDescriptor, "write"));
        }
        let Some(old) = self.file_len(ino) else {
            return Err(FsError::new(ErrorCode::IsADirectory, "write"));
        };
        let offset = if flags.append {
            old as u64
        } else {
            position.unwrap_or(cursor)
        };
        let end = offset
            .checked_add(bytes.len() as u64)
            .ok_or_else(|| FsError::new(ErrorCode::FileTooLarge, "write"))?;
        self.charge(old, end.max(old as u64))
            .map_err(|code| FsError::new(code, "write"))?;
        let node = self.node_mut(ino);
        if let NodeKind::File(data) = &mut node.kind {
            // `end` fits in usize once charged, and `offset <= end`.
            write_at(data, offset as usize, bytes);
        }
        node.touch_modified();
        if position.is_none() || flags.append {
            if let Some(file) = self.fds.get_mut(&fd) {
                file.position = end;
            }
        }
        Ok(bytes.len())
    }

    fn fd_inode(&self, fd: Fd, syscall: &'static str) -> FsResult<Ino> {
        Ok(self.open_file(fd, syscall)?.ino)
    }

    fn set_mode(&mut self, ino: Ino, mode: u32) {
        let node = self.node_mut(ino);
        node.perm = mode & 0o7777;
        node.touch_changed();
    }

    fn set_owner(&mut self, ino: Ino, uid: u32, gid: u32) {
        let node = self.node_mut(ino);
        node.uid = uid;
        node.gid = gid;
        node.touch_changed();
    }

    fn set_times(&mut self, ino: Ino, atime_secs: f64, mtime_secs: f64) {
        let node = self.node_mut(ino);
        node.atime_ms = atime_secs * 1000.0;
        node.mtime_ms = mtime_secs * 1000.0;
        node.touch_changed();
    }

    fn collect_files(&self, dir: Ino, prefix: &str, out: &mut Vec<String>) {
        if let NodeKind::Directory(entries) = &self.node(dir).kind {
            for (name, &child) in entries {
                let child_path = format!("{prefix}/{name}");
                match &self.node(child).kind {
                    NodeKind::File(_) => out.push(child_path),
                    NodeKind::Directory(_) => self.collect_files(child, &child_path, out),
                    NodeKind::Symlink(_) => {}
                }
            }
        }
    }

    fn snapshot(&self, dir: Ino) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        if let NodeKind::Directory(entries) = &self.node(dir).kind {
            for (name, &child) in entries {
                let value = match &self.node(child).kind {
                    NodeKind::File(data) => {
                        serde_json::Value::String(String::from_utf8_lossy(data).into_owned())
                    }
                    NodeKind::Directory(_) => self.snapshot(child),
                    NodeKind::Symlink(_) => continue,
                };
                map.insert(name.clone(), value);
            }
        }
        serde_json::Value::Object(map)
    }
}

/// A shared, in-memory filesystem volume.
#[derive(Debug)]
pub struct Volume {
    state: Mutex<State>,
}

impl Default for Volume {
    fn default() -> Self {
        Self::new()
    }
}

impl Volume {
    /// Default byte budget of a volume.
    pub const DEFAULT_CAPACITY: u64 = 64 * 1024 * 1024;

    /// Create an empty volume containing only `/`, with the default budget.
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Create an empty volume whose files may hold at most `capacity` bytes
    /// in total (`0` for no budget). Writes past it fail with `ENOSPC`; a
    /// single file never grows past 2 GiB (`EFBIG`).
    pub fn with_capacity(capacity: u64) -> Self {
        Self {
            state: Mutex::new(State::new(capacity)),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.state.lock().capacity
    }

    /// Bytes currently held by regular files.
    pub fn used_bytes(&self) -> u64 {
        self.state.lock().used
    }

    /// Create a volume seeded from a nested JSON tree.
    ///
    /// Strings become files, objects become directories, `null` becomes an
    /// empty directory. Keys may contain `/` to create intermediate
    /// directories.
    pub fn from_tree(tree: &serde_json::Value) -> FsResult<Self> {
        let volume = Self::new();
        volume.mount(tree, "/")?;
        Ok(volume)
    }

    /// Merge a JSON tree into the volume below `at`.
    pub fn mount(&self, tree: &serde_json::Value, at: &str) -> FsResult<()> {
        let serde_json::Value::Object(entries) = tree else {
            return Err(FsError::with_path(ErrorCode::InvalidArgument, "mount", at));
        };
        for (name, value) in entries {
            let target = path::join(at, name);
            match value {
                serde_json::Value::String(contents) => {
                    self.mkdir(&path::dirname(&target), true, 0o777)?;
                    self.write_file(&target, contents.as_bytes(), OpenFlags::WRITE, 0o666)?;
                }
                serde_json::Value::Object(_) => {
                    self.mkdir(&target, true, 0o777)?;
                    self.mount(value, &target)?;
                }
                serde_json::Value::Null => {
                    self.mkdir(&target, true, 0o777)?;
                }
                _ => {
                    return Err(FsError::with_path(ErrorCode::InvalidArgument, "mount", target));
                }
            }
        }
        Ok(())
    }

    /// Snapshot the volume back into the JSON tree shape (symlinks omitted).
    pub fn to_tree(&self) -> serde_json::Value {
        self.state.lock().snapshot(ROOT)
    }

    /// Absolute paths of every regular file, in lexical order.
    pub fn files(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.state.lock().collect_files(ROOT, "", &mut out);
        out
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().resolve(path, true, "access").is_ok()
    }

    pub fn is_file(&self, path: &str) -> bool {
        self.stat(path).map(|s| s.is_file()).unwrap_or(false)
    }

    pub fn is_directory(&self, path: &str) -> bool {
        self.stat(path).map(|s| s.is_directory()).unwrap_or(false)
    }

    /// Read a file as UTF-8 text.
    pub fn read_to_string(&self, path: &str) -> FsResult<String> {
        let bytes = self.read_file(path, OpenFlags::READ)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Check accessibility; `mode` is a mask of `R_OK`/`W_OK`/`X_OK` bits.
    pub fn access(&self, path: &str, mode: u32) -> FsResult<()> {
        let state = self.state.lock();
        let (ino, _) = state.resolve(path, true, "access")?;
        let owner = (state.node(ino).perm >> 6) & 0o7;
        if mode & 0o7 & !owner != 0 {
            return Err(FsError::with_path(ErrorCode::PermissionDenied, "access", path));
        }
        Ok(())
    }

    pub fn stat(&self, path: &str) -> FsResult<Stats> {
        self.state.lock().stat(path, true, "stat")
    }

    pub fn lstat(&self, path: &str) -> FsResult<Stats> {
        self.state.lock().stat(path, false, "lstat")
    }

    pub fn fstat(&self, fd: Fd) -> FsResult<Stats> {
        let state = self.state.lock();
        let ino = state.fd_inode(fd, "fstat")?;
        Ok(state.node(ino).stats(ino))
    }

    /// Create a directory. With `recursive`, returns the first directory
    /// actually created (or `None` if everything already existed).
    pub fn mkdir(&self, path: &str, recursive: bool, mode: u32) -> FsResult<Option<String>> {
        self.state.lock().mkdir(path, recursive, mode)
    }

    /// Create a uniquely named directory `prefix` + six random characters.
    pub fn mkdtemp(&self, prefix: &str) -> FsResult<String> {
        let mut state = self.state.lock();
        for _ in 0..MKDTEMP_ATTEMPTS {
            let suffix: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(6)
                .map(char::from)
                .collect();
            let candidate = format!("{prefix}{suffix}");
            if state.resolve(&candidate, false, "mkdtemp").is_ok() {
                continue;
            }
            state
                .mkdir(&candidate, false, 0o700)
                .map_err(|e| FsError::with_path(e.code, "mkdtemp", format!("{prefix}XXXXXX")))?;
            return Ok(candidate);
        }
        Err(FsError::with_path(
            ErrorCode::AlreadyExists,
            "mkdtemp",
            format!("{prefix}XXXXXX"),
        ))
    }

    pub fn rmdir(&self, path: &str, recursive: bool) -> FsResult<()> {
        self.state.lock().rmdir(path, recursive)
    }

    /// Entry names of a directory, sorted.
    pub fn readdir(&self, path: &str) -> FsResult<Vec<String>> {
        self.state.lock().readdir(path)
    }

    pub fn read_file(&self, path: &str, flags: OpenFlags) -> FsResult<Vec<u8>> {
        self.state.lock().read_file(path, flags)
    }

    pub fn write_file(&self, path: &str, data: &[u8], flags: OpenFlags, mode: u32) -> FsResult<()> {
        self.state.lock().write_file(path, data, flags, mode)
    }

    pub fn append_file(&self, path: &str, data: &[u8], mode: u32) -> FsResult<()> {
        self.state.lock().write_file(path, data, OpenFlags::APPEND, mode)
    }

    pub fn truncate(&self, path: &str, len: u64) -> FsResult<()> {
        let mut state = self.state.lock();
        let (ino, _) = state.resolve(path, true, "open")?;
        state.truncate_node(ino, len, Some(path), "open")
    }

    /// Copy a file; `mode` may contain [`COPYFILE_EXCL`].
    pub fn copy_file(&self, src: &str, dest: &str, mode: u32) -> FsResult<()> {
        self.state.lock().copy_file(src, dest, mode)
    }

    pub fn rename(&self, old: &str, new: &str) -> FsResult<()> {
        self.state.lock().rename(old, new)
    }

    pub fn unlink(&self, path: &str) -> FsResult<()> {
        self.state.lock().unlink(path)
    }

    pub fn link(&self, existing: &str, new: &str) -> FsResult<()> {
        self.state.lock().link(existing, new)
    }

    pub fn symlink(&self, target: &str, path: &str) -> FsResult<()> {
        self.state.lock().symlink(target, path)
    }

    pub fn readlink(&self, path: &str) -> FsResult<String> {
        self.state.lock().readlink(path)
    }

    /// Canonical absolute path with every symlink expanded.
    pub fn realpath(&self, path: &str) -> FsResult<String> {
        Ok(self.state.lock().resolve(path, true, "realpath")?.1)
    }

    pub fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> FsResult<Fd> {
        self.state.lock().open(path, flags, mode)
    }

    pub fn close(&self, fd: Fd) -> FsResult<()> {
        self.state.lock().close(fd)
    }

    /// Read up to `length` bytes. Without `position` the descriptor's
    /// cursor is used and advanced.
    pub fn read(&self, fd: Fd, length: usize, position: Option<u64>) -> FsResult<Vec<u8>> {
        self.state.lock().read_fd(fd, length, position)
    }

    /// Write `data`, returning the number of bytes written.
    pub fn write(&self, fd: Fd, data: &[u8], position: Option<u64>) -> FsResult<usize> {
        self.state.lock().write_fd(fd, data, position)
    }

    pub fn fsync(&self, fd: Fd) -> FsResult<()> {
        self.state.lock().fd_inode(fd, "fsync").map(|_| ())
    }

    pub fn fdatasync(&self, fd: Fd) -> FsResult<()> {
        self.state.lock().fd_inode(fd, "fdatasync").map(|_| ())
    }

    pub fn ftruncate(&self, fd: Fd, len: u64) -> FsResult<()> {
        let mut state = self.state.lock();
        let file = state.open_file(fd, "ftruncate")?;
        if !file.flags.write {
            return Err(FsError::new(ErrorCode::BadDescriptor, "ftruncate"));
        }
        let ino = file.ino;
        state.truncate_node(ino, len, None, "ftruncate")
    }

    pub fn chmod(&self, path: &str, mode: u32) -> FsResult<()> {
        let mut state = self.state.lock();
        let (ino, _) = state.resolve(path, true, "chmod")?;
        state.set_mode(ino, mode);
        Ok(())
    }

    pub fn lchmod(&self, path: &str, mode: u32) -> FsResult<()> {
        let mut state = self.state.lock();
        let (ino, _) = state.resolve(path, false, "lchmod")?;
        state.set_mode(ino, mode);
        Ok(())
    }

    pub fn fchmod(&self, fd: Fd, mode: u32) -> FsResult<()> {
        let mut state = self.state.lock();
        let ino = state.fd_inode(fd, "fchmod")?;
        state.set_mode(ino, mode);
        Ok(())
    }

    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        let mut state = self.state.lock();
        let (ino, _) = state.resolve(path, true, "chown")?;
        state.set_owner(ino, uid, gid);
        Ok(())
    }

    pub fn lchown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        let mut state = self.state.lock();
        let (ino, _) = state.resolve(path, false, "lchown")?;
        state.set_owner(ino, uid, gid);
        Ok(())
    }

    pub fn fchown(&self, fd: Fd, uid: u32, gid: u32) -> FsResult<()> {
        let mut state = self.state.lock();
        let ino = state.fd_inode(fd, "fchown")?;
        state.set_owner(ino, uid, gid);
        Ok(())
    }

    /// Set access and modification times, in seconds since the epoch.
    pub fn utimes(&self, path: &str, atime: f64, mtime: f64) -> FsResult<()> {
        let mut state = self.state.lock();
        let (ino, _) = state.resolve(path, true, "utime")?;
        state.set_times(ino, atime, mtime);
        Ok(())
    }

    pub fn futimes(&self, fd: Fd, atime: f64, mtime: f64) -> FsResult<()> {
        let mut state = self.state.lock();
        let ino = state.fd_inode(fd, "futime")?;
        state.set_times(ino, atime, mtime);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seeded() -> Volume {
        Volume::from_tree(&json!({
            "src": {
                "a.js": "export default 41 + 1;",
                "lib": { "util.js": "export const x = 1;" }
            },
            "empty": null
        }))
        .unwrap()
    }

    #[test]
    fn test_from_tree_and_snapshot() {
        let volume = seeded();
        assert!(volume.is_file("/src/a.js"));
        assert!(volume.is_directory("/src/lib"));
        assert!(volume.is_directory("/empty"));
        assert_eq!(volume.files(), vec!["/src/a.js", "/src/lib/util.js"]);
        assert_eq!(
            volume.to_tree()["src"]["a.js"],
            json!("export default 41 + 1;")
        );
    }

    #[test]
    fn test_from_tree_rejects_non_string_leaves() {
        let err = Volume::from_tree(&json!({ "n": 1 })).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgument);
    }

    #[test]
    fn test_write_read_round_trip() {
        let volume = seeded();
        let bytes = [0u8, 159, 146, 150, 255];
        volume
            .write_file("/src/bin.dat", &bytes, OpenFlags::WRITE, 0o666)
            .unwrap();
        assert_eq!(volume.read_file("/src/bin.dat", OpenFlags::READ).unwrap(), bytes);

        volume.append_file("/src/bin.dat", b"!", 0o666).unwrap();
        assert_eq!(volume.stat("/src/bin.dat").unwrap().size, 6);
    }

    #[test]
    fn test_missing_file_error() {
        let volume = seeded();
        let err = volume.read_file("/nope.txt", OpenFlags::READ).unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
        assert_eq!(err.to_string(), "ENOENT: no such file or directory, open '/nope.txt'");
    }

    #[test]
    fn test_mkdir_recursive_returns_first_created() {
        let volume = seeded();
        let first = volume.mkdir("/src/deep/er/dir", true, 0o777).unwrap();
        assert_eq!(first.as_deref(), Some("/src/deep"));
        assert_eq!(volume.mkdir("/src/deep", true, 0o777).unwrap(), None);

        let err = volume.mkdir("/src", false, 0o777).unwrap_err();
        assert_eq!(err.code, ErrorCode::AlreadyExists);
        let err = volume.mkdir("/src/a.js/x", true, 0o777).unwrap_err();
        assert_eq!(err.code, ErrorCode::NotADirectory);
    }

    #[test]
    fn test_rmdir() {
        let volume = seeded();
        let err = volume.rmdir("/src", false).unwrap_err();
        assert_eq!(err.code, ErrorCode::DirectoryNotEmpty);
        volume.rmdir("/empty", false).unwrap();
        volume.rmdir("/src", true).unwrap();
        assert!(!volume.exists("/src/a.js"));
        assert!(volume.files().is_empty());
    }

    #[test]
    fn test_rename_and_unlink() {
        let volume = seeded();
        volume.rename("/src/a.js", "/src/b.js").unwrap();
        assert!(!volume.exists("/src/a.js"));
        assert!(volume.is_file("/src/b.js"));

        let err = volume.rename("/src", "/src/lib/inner").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgument);

        let err = volume.unlink("/src/lib").unwrap_err();
        assert_eq!(err.code, ErrorCode::IsADirectory);
        volume.unlink("/src/b.js").unwrap();
        assert!(!volume.exists("/src/b.js"));
    }

    #[test]
    fn test_copy_file_exclusive() {
        let volume = seeded();
        volume.copy_file("/src/a.js", "/src/c.js", 0).unwrap();
        assert_eq!(
            volume.read_to_string("/src/c.js").unwrap(),
            "export default 41 + 1;"
        );
        let err = volume.copy_file("/src/a.js", "/src/c.js", COPYFILE_EXCL).unwrap_err();
        assert_eq!(err.code, ErrorCode::AlreadyExists);
        assert_eq!(err.dest.as_deref(), Some("/src/c.js"));
    }

    #[test]
    fn test_hard_links_share_content() {
        let volume = seeded();
        volume.link("/src/a.js", "/src/hard.js").unwrap();
        assert_eq!(volume.stat("/src/a.js").unwrap().nlink, 2);
        volume
            .write_file("/src/hard.js", b"changed", OpenFlags::WRITE, 0o666)
            .unwrap();
        assert_eq!(volume.read_to_string("/src/a.js").unwrap(), "changed");
        volume.unlink("/src/a.js").unwrap();
        assert_eq!(volume.read_to_string("/src/hard.js").unwrap(), "changed");
    }

    #[test]
    fn test_symlinks() {
        let volume = seeded();
        volume.symlink("lib/util.js", "/src/link.js").unwrap();
        assert_eq!(volume.readlink("/src/link.js").unwrap(), "lib/util.js");
        assert_eq!(volume.realpath("/src/link.js").unwrap(), "/src/lib/util.js");
        assert!(volume.lstat("/src/link.js").unwrap().is_symlink());
        assert!(volume.stat("/src/link.js").unwrap().is_file());

        volume.symlink("/src/lib", "/libdir").unwrap();
        assert_eq!(volume.readdir("/libdir").unwrap(), vec!["util.js"]);

        volume.symlink("/loop", "/loop").unwrap();
        let err = volume.stat("/loop").unwrap_err();
        assert_eq!(err.code, ErrorCode::TooManyLinks);

        let err = volume.readlink("/src/a.js").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgument);
    }

    #[test]
    fn test_descriptor_io() {
        let volume = seeded();
        let fd = volume
            .open("/src/log.txt", OpenFlags::parse("w+").unwrap(), 0o644)
            .unwrap();
        assert_eq!(volume.write(fd, b"hello world", None).unwrap(), 11);
        assert_eq!(volume.read(fd, 5, Some(0)).unwrap(), b"hello");
        volume.write(fd, b"HELLO", Some(0)).unwrap();
        volume.ftruncate(fd, 5).unwrap();
        volume.fsync(fd).unwrap();
        assert_eq!(volume.fstat(fd).unwrap().size, 5);
        volume.close(fd).unwrap();

        assert_eq!(volume.read_to_string("/src/log.txt").unwrap(), "HELLO");
        let err = volume.close(fd).unwrap_err();
        assert_eq!(err.code, ErrorCode::BadDescriptor);
    }

    #[test]
    fn test_read_only_descriptor_rejects_writes() {
        let volume = seeded();
        let fd = volume.open("/src/a.js", OpenFlags::READ, 0o666).unwrap();
        let err = volume.write(fd, b"x", None).unwrap_err();
        assert_eq!(err.code, ErrorCode::BadDescriptor);
        let err = volume
            .open("/src/a.js", OpenFlags::parse("wx").unwrap(), 0o666)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::AlreadyExists);
    }

    #[test]
    fn test_metadata_updates() {
        let volume = seeded();
        volume.chmod("/src/a.js", 0o400).unwrap();
        assert_eq!(volume.stat("/src/a.js").unwrap().mode, S_IFREG | 0o400);
        assert!(volume.access("/src/a.js", 4).is_ok());
        let err = volume.access("/src/a.js", 2).unwrap_err();
        assert_eq!(err.code, ErrorCode::PermissionDenied);

        volume.chown("/src/a.js", 1000, 100).unwrap();
        let stats = volume.stat("/src/a.js").unwrap();
        assert_eq!((stats.uid, stats.gid), (1000, 100));

        volume.utimes("/src/a.js", 1.5, 2.0).unwrap();
        let stats = volume.stat("/src/a.js").unwrap();
        assert_eq!(stats.atime_ms, 1500.0);
        assert_eq!(stats.mtime_ms, 2000.0);
    }

    #[test]
    fn test_volume_budget() {
        let volume = Volume::with_capacity(16);
        volume.write_file("/a", b"0123456789", OpenFlags::WRITE, 0o666).unwrap();
        assert_eq!(volume.used_bytes(), 10);

        let err = volume.append_file("/a", b"0123456789", 0o666).unwrap_err();
        assert_eq!(err.code, ErrorCode::NoSpace);
        assert_eq!(err.to_string(), "ENOSPC: no space left on device, write '/a'");
        let err = volume.truncate("/a", 1 << 52).unwrap_err();
        assert_eq!(err.code, ErrorCode::FileTooLarge);
        let err = volume.truncate("/a", 17).unwrap_err();
        assert_eq!(err.code, ErrorCode::NoSpace);
        assert_eq!(volume.stat("/a").unwrap().size, 10);

        // Space comes back once files shrink or go away.
        volume.truncate("/a", 4).unwrap();
        volume.write_file("/b", b"0123456789ab", OpenFlags::WRITE, 0o666).unwrap();
        assert_eq!(volume.used_bytes(), 16);
        volume.unlink("/b").unwrap();
        volume.write_file("/a", b"", OpenFlags::WRITE, 0o666).unwrap();
        assert_eq!(volume.used_bytes(), 0);
    }

    #[test]
    fn test_descriptor_offsets_are_bounded() {
        let volume = seeded();
        let fd = volume
            .open("/src/big.bin", OpenFlags::parse("w+").unwrap(), 0o644)
            .unwrap();
        let err = volume.write(fd, b"x", Some(u64::MAX)).unwrap_err();
        assert_eq!(err.code, ErrorCode::FileTooLarge);
        let err = volume.write(fd, b"x", Some(1 << 40)).unwrap_err();
        assert_eq!(err.code, ErrorCode::FileTooLarge);
        let err = volume.ftruncate(fd, 1 << 52).unwrap_err();
        assert_eq!(err.code, ErrorCode::FileTooLarge);

        volume.write(fd, b"hello", None).unwrap();
        assert_eq!(volume.read(fd, usize::MAX, Some(1)).unwrap(), b"ello");
        assert!(volume.read(fd, usize::MAX, Some(u64::MAX)).unwrap().is_empty());
        volume.close(fd).unwrap();
    }

    #[test]
    fn test_mkdtemp_creates_unique_dirs() {
        let volume = seeded();
        let a = volume.mkdtemp("/tmp-").unwrap();
        let b = volume.mkdtemp("/tmp-").unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("/tmp-") && a.len() == "/tmp-".len() + 6);
        assert!(volume.is_directory(&a));
    }
}
