//! Guest `fs` backed by the in-memory [`Volume`].
//!
//! Every operation is exposed twice on the `__fs` namespace: `nameSync`
//! returns directly and `name` returns a promise or takes a Node-style
//! callback. The guest-side shim adds `Stats` methods, `Date` fields and
//! buffer-oriented `read`/`write` signatures.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use super::{Args, Capability, CapabilityProvider, Grants};
use crate::bridge::{HostError, HostFunction, HostValue};
use crate::error::Result;
use crate::vfs::{Fd, OpenFlags, Stats, Volume};

const FS_SHIM: &str = include_str!("fs_shim.js");
const BUFFER: &str = include_str!("buffer.js");

type FsOp = fn(&Volume, &Args<'_>) -> std::result::Result<HostValue, HostError>;
type OpResult = std::result::Result<HostValue, HostError>;

/// Operation names exposed on `__fs` (each also as `<name>Sync`).
pub const FS_OPERATIONS: &[&str] = &[
    "access",
    "exists",
    "stat",
    "lstat",
    "fstat",
    "mkdir",
    "mkdtemp",
    "rmdir",
    "readdir",
    "readFile",
    "writeFile",
    "appendFile",
    "truncate",
    "copyFile",
    "rename",
    "unlink",
    "link",
    "symlink",
    "readlink",
    "realpath",
    "open",
    "close",
    "read",
    "write",
    "fsync",
    "fdatasync",
    "ftruncate",
    "chmod",
    "lchmod",
    "fchmod",
    "chown",
    "lchown",
    "fchown",
    "utimes",
    "futimes",
];

fn operation(name: &str) -> Option<FsOp> {
    let op: FsOp = match name {
        "access" => access,
        "exists" => exists,
        "stat" => stat,
        "lstat" => lstat,
        "fstat" => fstat,
        "mkdir" => mkdir,
        "mkdtemp" => mkdtemp,
        "rmdir" => rmdir,
        "readdir" => readdir,
        "readFile" => read_file,
        "writeFile" => write_file,
        "appendFile" => append_file,
        "truncate" => truncate,
        "copyFile" => copy_file,
        "rename" => rename,
        "unlink" => unlink,
        "link" => link,
        "symlink" => symlink,
        "readlink" => readlink,
        "realpath" => realpath,
        "open" => open,
        "close" => close,
        "read" => read,
        "write" => write,
        "fsync" => fsync,
        "fdatasync" => fdatasync,
        "ftruncate" => ftruncate,
        "chmod" => chmod,
        "lchmod" => lchmod,
        "fchmod" => fchmod,
        "chown" => chown,
        "lchown" => lchown,
        "fchown" => fchown,
        "utimes" => utimes,
        "futimes" => futimes,
        _ => return None,
    };
    Some(op)
}

/// Grants `__fs` when `allow_filesystem` is set.
#[derive(Debug, Default, Clone, Copy)]
pub struct FilesystemProvider;

impl CapabilityProvider for FilesystemProvider {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    fn provide(&self, grants: &Grants<'_>) -> Result<Option<Capability>> {
        if !grants.options.allow_filesystem {
            return Ok(None);
        }
        Ok(Some(filesystem_capability(grants.volume.clone())))
    }
}

/// Build the filesystem capability over `volume`.
pub fn filesystem_capability(volume: Arc<Volume>) -> Capability {
    let mut capability = Capability::namespace("filesystem", "__fs")
        .with_script_global("Buffer", BUFFER)
        .with_shim(FS_SHIM);
    for &name in FS_OPERATIONS {
        let Some(op) = operation(name) else {
            continue;
        };
        let sync_op: FsOp = if name == "readFile" { read_file_text } else { op };
        let sync_volume = volume.clone();
        capability = capability.with_function(
            format!("{name}Sync"),
            HostFunction::sync(move |args| sync_op(&sync_volume, &Args(args))),
        );
        let deferred_volume = volume.clone();
        capability = capability.with_function(
            name,
            HostFunction::deferred(move |args| op(&deferred_volume, &Args(args))),
        );
    }
    capability
}

/// Byte/text encodings accepted by `readFile`, `writeFile` and `write`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Utf8,
    Latin1,
    Ascii,
    Base64,
    Hex,
}

impl Encoding {
    fn parse(name: &str) -> std::result::Result<Option<Self>, HostError> {
        let encoding = match name.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Encoding::Utf8,
            "latin1" | "binary" => Encoding::Latin1,
            "ascii" => Encoding::Ascii,
            "base64" => Encoding::Base64,
            "hex" => Encoding::Hex,
            "buffer" => return Ok(None),
            other => {
                return Err(HostError::type_error(format!("Unknown encoding: {other}"))
                    .with_property("code", "ERR_UNKNOWN_ENCODING"))
            }
        };
        Ok(Some(encoding))
    }

    fn decode(self, bytes: &[u8]) -> String {
        match self {
            Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Encoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
            Encoding::Ascii => bytes.iter().map(|&b| (b & 0x7f) as char).collect(),
            Encoding::Base64 => BASE64.encode(bytes),
            Encoding::Hex => hex::encode(bytes),
        }
    }

    fn encode(self, text: &str) -> std::result::Result<Vec<u8>, HostError> {
        Ok(match self {
            Encoding::Utf8 => text.as_bytes().to_vec(),
            Encoding::Latin1 | Encoding::Ascii => text.chars().map(|c| c as u32 as u8).collect(),
            Encoding::Base64 => BASE64
                .decode(text.trim_end_matches('\n'))
                .map_err(|e| HostError::type_error(format!("invalid base64 data: {e}")))?,
            Encoding::Hex => hex::decode(text)
                .map_err(|e| HostError::type_error(format!("invalid hex data: {e}")))?,
        })
    }
}

const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;
const SAFE_RANGE: &str = ">= 0 && <= 9007199254740991";

impl Args<'_> {
    fn path(&self, idx: usize) -> std::result::Result<String, HostError> {
        self.string(idx, "path")
    }

    fn fd(&self, idx: usize) -> std::result::Result<Fd, HostError> {
        match self.get(idx) {
            HostValue::Number(n) if n.fract() == 0.0 && *n >= 0.0 && *n <= i32::MAX as f64 => {
                Ok(*n as Fd)
            }
            other => Err(HostError::invalid_arg("fd", "of type number", other)),
        }
    }

    fn number_or(&self, idx: usize, name: &str, default: f64) -> std::result::Result<f64, HostError> {
        match self.get(idx) {
            HostValue::Undefined | HostValue::Null => Ok(default),
            HostValue::Number(n) => Ok(*n),
            other => Err(HostError::invalid_arg(name, "of type number", other)),
        }
    }

    /// A byte count or offset. Negative values count as zero; values past
    /// `Number.MAX_SAFE_INTEGER` are a `RangeError`.
    fn size(&self, idx: usize, name: &str) -> std::result::Result<u64, HostError> {
        let n = self.number_or(idx, name, 0.0)?;
        if n.is_nan() || n <= 0.0 {
            return Ok(0);
        }
        if n > MAX_SAFE_INTEGER {
            return Err(HostError::out_of_range(name, SAFE_RANGE, n));
        }
        Ok(n as u64)
    }

    /// Permission bits as a number or octal string.
    fn mode(&self, idx: usize, default: u32) -> std::result::Result<u32, HostError> {
        match self.get(idx) {
            HostValue::Undefined | HostValue::Null => Ok(default),
            HostValue::Number(n) => Ok(*n as u32),
            HostValue::String(s) => u32::from_str_radix(s, 8).map_err(|_| {
                HostError::invalid_arg("mode", "an integer or an octal string", self.get(idx))
            }),
            HostValue::Object(_) => Ok(self.option_mode(idx, default)),
            other => Err(HostError::invalid_arg("mode", "of type number", other)),
        }
    }

    /// Encoding from a string argument or an options object.
    fn encoding(&self, idx: usize) -> std::result::Result<Option<Encoding>, HostError> {
        let value = self.get(idx);
        let name = match value {
            HostValue::String(s) => Some(s.as_str()),
            HostValue::Object(_) => value.get("encoding").and_then(HostValue::as_str),
            _ => None,
        };
        match name {
            Some(name) => Encoding::parse(name),
            None => Ok(None),
        }
    }

    /// Open flags from an options object's `flag`.
    fn flag(&self, idx: usize, default: OpenFlags) -> std::result::Result<OpenFlags, HostError> {
        match self.get(idx).get("flag") {
            Some(HostValue::String(flag)) => Ok(OpenFlags::parse(flag)?),
            Some(HostValue::Number(bits)) => Ok(OpenFlags::from_bits(*bits as u32)),
            _ => Ok(default),
        }
    }

    /// `mode` from an options object only; string options are encodings.
    fn option_mode(&self, idx: usize, default: u32) -> u32 {
        self.get(idx)
            .get("mode")
            .and_then(HostValue::as_f64)
            .map(|n| n as u32)
            .unwrap_or(default)
    }

    fn recursive(&self, idx: usize) -> bool {
        self.get(idx)
            .get("recursive")
            .and_then(HostValue::as_bool)
            .unwrap_or(false)
    }

    fn data(&self, idx: usize, encoding: Option<Encoding>) -> std::result::Result<Vec<u8>, HostError> {
        match self.get(idx) {
            HostValue::String(s) => encoding.unwrap_or(Encoding::Utf8).encode(s),
            HostValue::Bytes(bytes) => Ok(bytes.clone()),
            other => Err(HostError::invalid_arg(
                "data",
                "of type string or an instance of Uint8Array",
                other,
            )),
        }
    }

    fn position(&self, idx: usize) -> std::result::Result<Option<u64>, HostError> {
        match self.get(idx) {
            HostValue::Undefined | HostValue::Null => Ok(None),
            HostValue::Number(n) if *n < 0.0 => Ok(None),
            HostValue::Number(n) if *n > MAX_SAFE_INTEGER => {
                Err(HostError::out_of_range("position", SAFE_RANGE, *n))
            }
            HostValue::Number(n) => Ok(Some(*n as u64)),
            other => Err(HostError::invalid_arg("position", "of type number", other)),
        }
    }

    /// A time in seconds, from a number or numeric string.
    fn time(&self, idx: usize, name: &str) -> std::result::Result<f64, HostError> {
        match self.get(idx) {
            HostValue::Number(n) => Ok(*n),
            HostValue::String(s) => s
                .trim()
                .parse()
                .map_err(|_| HostError::invalid_arg(name, "a number or Date", self.get(idx))),
            other => Err(HostError::invalid_arg(name, "a number or Date", other)),
        }
    }
}

fn undefined(_: ()) -> HostValue {
    HostValue::Undefined
}

fn stats_value(stats: Stats) -> OpResult {
    serde_json::to_value(stats)
        .map(HostValue::from)
        .map_err(|e| HostError::new("Error", format!("failed to encode stats: {e}")))
}

fn access(volume: &Volume, args: &Args<'_>) -> OpResult {
    let mode = args.mode(1, 0)?;
    Ok(volume.access(&args.path(0)?, mode).map(undefined)?)
}

fn exists(volume: &Volume, args: &Args<'_>) -> OpResult {
    Ok(HostValue::Bool(
        args.path(0).map(|p| volume.exists(&p)).unwrap_or(false),
    ))
}

fn stat(volume: &Volume, args: &Args<'_>) -> OpResult {
    stats_value(volume.stat(&args.path(0)?)?)
}

fn lstat(volume: &Volume, args: &Args<'_>) -> OpResult {
    stats_value(volume.lstat(&args.path(0)?)?)
}

fn fstat(volume: &Volume, args: &Args<'_>) -> OpResult {
    stats_value(volume.fstat(args.fd(0)?)?)
}

fn mkdir(volume: &Volume, args: &Args<'_>) -> OpResult {
    let path = args.path(0)?;
    let mode = args.mode(1, 0o777)?;
    let created = volume.mkdir(&path, args.recursive(1), mode)?;
    Ok(created.map(HostValue::String).unwrap_or_default())
}

fn mkdtemp(volume: &Volume, args: &Args<'_>) -> OpResult {
    let prefix = args.string(0, "prefix")?;
    Ok(HostValue::String(volume.mkdtemp(&prefix)?))
}

fn rmdir(volume: &Volume, args: &Args<'_>) -> OpResult {
    Ok(volume.rmdir(&args.path(0)?, args.recursive(1)).map(undefined)?)
}

fn readdir(volume: &Volume, args: &Args<'_>) -> OpResult {
    let entries = volume.readdir(&args.path(0)?)?;
    Ok(HostValue::Array(entries.into_iter().map(HostValue::String).collect()))
}

fn read_file(volume: &Volume, args: &Args<'_>) -> OpResult {
    let path = args.path(0)?;
    let encoding = args.encoding(1)?;
    let flags = args.flag(1, OpenFlags::READ)?;
    let bytes = volume.read_file(&path, flags)?;
    Ok(match encoding {
        Some(encoding) => HostValue::String(encoding.decode(&bytes)),
        None => HostValue::Bytes(bytes),
    })
}

/// `readFileSync` always hands back text, whatever the encoding argument.
fn read_file_text(volume: &Volume, args: &Args<'_>) -> OpResult {
    Ok(match read_file(volume, args)? {
        HostValue::Bytes(bytes) => HostValue::String(String::from_utf8_lossy(&bytes).into_owned()),
        other => other,
    })
}

fn write_file(volume: &Volume, args: &Args<'_>) -> OpResult {
    let path = args.path(0)?;
    let data = args.data(1, args.encoding(2)?)?;
    let flags = args.flag(2, OpenFlags::WRITE)?;
    let mode = args.option_mode(2, 0o666);
    Ok(volume.write_file(&path, &data, flags, mode).map(undefined)?)
}

fn append_file(volume: &Volume, args: &Args<'_>) -> OpResult {
    let path = args.path(0)?;
    let data = args.data(1, args.encoding(2)?)?;
    let flags = args.flag(2, OpenFlags::APPEND)?;
    let mode = args.option_mode(2, 0o666);
    Ok(volume.write_file(&path, &data, flags, mode).map(undefined)?)
}

fn truncate(volume: &Volume, args: &Args<'_>) -> OpResult {
    let len = args.size(1, "len")?;
    Ok(volume.truncate(&args.path(0)?, len).map(undefined)?)
}

fn copy_file(volume: &Volume, args: &Args<'_>) -> OpResult {
    let src = args.string(0, "src")?;
    let dest = args.string(1, "dest")?;
    let mode = args.number_or(2, "mode", 0.0)? as u32;
    Ok(volume.copy_file(&src, &dest, mode).map(undefined)?)
}

fn rename(volume: &Volume, args: &Args<'_>) -> OpResult {
    let old = args.string(0, "oldPath")?;
    let new = args.string(1, "newPath")?;
    Ok(volume.rename(&old, &new).map(undefined)?)
}

fn unlink(volume: &Volume, args: &Args<'_>) -> OpResult {
    Ok(volume.unlink(&args.path(0)?).map(undefined)?)
}

fn link(volume: &Volume, args: &Args<'_>) -> OpResult {
    let existing = args.string(0, "existingPath")?;
    let new = args.string(1, "newPath")?;
    Ok(volume.link(&existing, &new).map(undefined)?)
}

fn symlink(volume: &Volume, args: &Args<'_>) -> OpResult {
    let target = args.string(0, "target")?;
    let path = args.path(1)?;
    Ok(volume.symlink(&target, &path).map(undefined)?)
}

fn readlink(volume: &Volume, args: &Args<'_>) -> OpResult {
    Ok(HostValue::String(volume.readlink(&args.path(0)?)?))
}

fn realpath(volume: &Volume, args: &Args<'_>) -> OpResult {
    Ok(HostValue::String(volume.realpath(&args.path(0)?)?))
}

fn open(volume: &Volume, args: &Args<'_>) -> OpResult {
    let path = args.path(0)?;
    let flags = match args.get(1) {
        HostValue::Undefined | HostValue::Null => OpenFlags::READ,
        HostValue::String(flags) => OpenFlags::parse(flags)?,
        HostValue::Number(bits) => OpenFlags::from_bits(*bits as u32),
        other => return Err(HostError::invalid_arg("flags", "of type string or number", other)),
    };
    let mode = args.mode(2, 0o666)?;
    Ok(HostValue::Number(volume.open(&path, flags, mode)? as f64))
}

fn close(volume: &Volume, args: &Args<'_>) -> OpResult {
    Ok(volume.close(args.fd(0)?).map(undefined)?)
}

/// `read(fd, length, position)`; the shim copies the bytes into the
/// caller's buffer.
fn read(volume: &Volume, args: &Args<'_>) -> OpResult {
    let fd = args.fd(0)?;
    let length = usize::try_from(args.size(1, "length")?).unwrap_or(usize::MAX);
    let position = args.position(2)?;
    Ok(HostValue::Bytes(volume.read(fd, length, position)?))
}

/// `write(fd, data, position, encoding)`; returns bytes written.
fn write(volume: &Volume, args: &Args<'_>) -> OpResult {
    let fd = args.fd(0)?;
    let data = args.data(1, args.encoding(3)?)?;
    let position = args.position(2)?;
    Ok(HostValue::Number(volume.write(fd, &data, position)? as f64))
}

fn fsync(volume: &Volume, args: &Args<'_>) -> OpResult {
    Ok(volume.fsync(args.fd(0)?).map(undefined)?)
}

fn fdatasync(volume: &Volume, args: &Args<'_>) -> OpResult {
    Ok(volume.fdatasync(args.fd(0)?).map(undefined)?)
}

fn ftruncate(volume: &Volume, args: &Args<'_>) -> OpResult {
    let len = args.size(1, "len")?;
    Ok(volume.ftruncate(args.fd(0)?, len).map(undefined)?)
}

fn chmod(volume: &Volume, args: &Args<'_>) -> OpResult {
    let mode = args.mode(1, 0o666)?;
    Ok(volume.chmod(&args.path(0)?, mode).map(undefined)?)
}

fn lchmod(volume: &Volume, args: &Args<'_>) -> OpResult {
    let mode = args.mode(1, 0o666)?;
    Ok(volume.lchmod(&args.path(0)?, mode).map(undefined)?)
}

fn fchmod(volume: &Volume, args: &Args<'_>) -> OpResult {
    let mode = args.mode(1, 0o666)?;
    Ok(volume.fchmod(args.fd(0)?, mode).map(undefined)?)
}

fn ids(args: &Args<'_>) -> std::result::Result<(u32, u32), HostError> {
    Ok((
        args.number_or(1, "uid", 0.0)? as u32,
        args.number_or(2, "gid", 0.0)? as u32,
    ))
}

fn chown(volume: &Volume, args: &Args<'_>) -> OpResult {
    let (uid, gid) = ids(args)?;
    Ok(volume.chown(&args.path(0)?, uid, gid).map(undefined)?)
}

fn lchown(volume: &Volume, args: &Args<'_>) -> OpResult {
    let (uid, gid) = ids(args)?;
    Ok(volume.lchown(&args.path(0)?, uid, gid).map(undefined)?)
}

fn fchown(volume: &Volume, args: &Args<'_>) -> OpResult {
    let (uid, gid) = ids(args)?;
    Ok(volume.fchown(args.fd(0)?, uid, gid).map(undefined)?)
}

fn utimes(volume: &Volume, args: &Args<'_>) -> OpResult {
    let atime = args.time(1, "atime")?;
    let mtime = args.time(2, "mtime")?;
    Ok(volume.utimes(&args.path(0)?, atime, mtime).map(undefined)?)
}

fn futimes(volume: &Volume, args: &Args<'_>) -> OpResult {
    let atime = args.time(1, "atime")?;
    let mtime = args.time(2, "mtime")?;
    Ok(volume.futimes(args.fd(0)?, atime, mtime).map(undefined)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(capability: &Capability, name: &str, args: &[HostValue]) -> OpResult {
        capability
            .function(name)
            .expect("operation exists")
            .call_blocking(args)
    }

    fn volume() -> Arc<Volume> {
        Arc::new(Volume::from_tree(&json!({ "src": { "a.txt": "hello" } })).unwrap())
    }

    #[test]
    fn test_every_operation_has_both_forms() {
        let capability = filesystem_capability(volume());
        for name in FS_OPERATIONS {
            assert!(operation(name).is_some(), "{name}");
            assert!(matches!(capability.function(name), Some(HostFunction::Deferred(_))));
            assert!(matches!(
                capability.function(&format!("{name}Sync")),
                Some(HostFunction::Sync(_))
            ));
        }
        assert_eq!(capability.namespace_name(), Some("__fs"));
    }

    #[test]
    fn test_read_and_write() {
        let capability = filesystem_capability(volume());
        let text = call(
            &capability,
            "readFileSync",
            &["/src/a.txt".into(), "utf8".into()],
        )
        .unwrap();
        assert_eq!(text, HostValue::from("hello"));

        let text = call(&capability, "readFileSync", &["/src/a.txt".into()]).unwrap();
        assert_eq!(text, HostValue::from("hello"));
        let bytes = call(&capability, "readFile", &["/src/a.txt".into()]).unwrap();
        assert_eq!(bytes, HostValue::Bytes(b"hello".to_vec()));

        call(
            &capability,
            "writeFileSync",
            &["/src/b.txt".into(), "aGk=".into(), "base64".into()],
        )
        .unwrap();
        let text = call(
            &capability,
            "readFileSync",
            &["/src/b.txt".into(), HostValue::from(json!({ "encoding": "utf8" }))],
        )
        .unwrap();
        assert_eq!(text, HostValue::from("hi"));

        call(&capability, "appendFileSync", &["/src/b.txt".into(), "!".into()]).unwrap();
        let hex = call(&capability, "readFileSync", &["/src/b.txt".into(), "hex".into()]).unwrap();
        assert_eq!(hex, HostValue::from("686921"));
    }

    #[test]
    fn test_errors_carry_node_codes() {
        let capability = filesystem_capability(volume());
        let err = call(&capability, "readFileSync", &["/missing".into()]).unwrap_err();
        assert_eq!(err.code(), Some("ENOENT"));
        assert_eq!(err.properties.get("syscall"), Some(&HostValue::from("open")));

        let err = call(&capability, "statSync", &[HostValue::Number(1.0)]).unwrap_err();
        assert_eq!(err.name, "TypeError");
        assert_eq!(err.code(), Some("ERR_INVALID_ARG_TYPE"));

        let err = call(
            &capability,
            "readFileSync",
            &["/src/a.txt".into(), "klingon".into()],
        )
        .unwrap_err();
        assert_eq!(err.code(), Some("ERR_UNKNOWN_ENCODING"));
    }

    #[test]
    fn test_descriptor_io() {
        let capability = filesystem_capability(volume());
        let fd = call(&capability, "openSync", &["/src/c.txt".into(), "w+".into()]).unwrap();
        let written = call(
            &capability,
            "writeSync",
            &[fd.clone(), HostValue::Bytes(b"abcdef".to_vec())],
        )
        .unwrap();
        assert_eq!(written, HostValue::Number(6.0));

        let chunk = call(
            &capability,
            "readSync",
            &[fd.clone(), HostValue::Number(3.0), HostValue::Number(2.0)],
        )
        .unwrap();
        assert_eq!(chunk, HostValue::Bytes(b"cde".to_vec()));

        call(&capability, "closeSync", &[fd.clone()]).unwrap();
        let err = call(&capability, "closeSync", &[fd]).unwrap_err();
        assert_eq!(err.code(), Some("EBADF"));
    }

    #[test]
    fn test_sizes_and_offsets_are_range_checked() {
        let capability = filesystem_capability(volume());
        let fd = call(&capability, "openSync", &["/src/a.txt".into(), "r+".into()]).unwrap();

        let err = call(
            &capability,
            "readSync",
            &[fd.clone(), HostValue::Number(1e20), HostValue::Number(1.0)],
        )
        .unwrap_err();
        assert_eq!(err.name, "RangeError");
        assert_eq!(err.code(), Some("ERR_OUT_OF_RANGE"));

        let err = call(
            &capability,
            "writeSync",
            &[fd.clone(), "x".into(), HostValue::Number(f64::INFINITY)],
        )
        .unwrap_err();
        assert_eq!(err.code(), Some("ERR_OUT_OF_RANGE"));

        let err = call(
            &capability,
            "ftruncateSync",
            &[fd.clone(), HostValue::Number(2f64.powi(52))],
        )
        .unwrap_err();
        assert_eq!(err.code(), Some("EFBIG"));

        let chunk = call(
            &capability,
            "readSync",
            &[fd, HostValue::Number(-5.0), HostValue::Number(0.0)],
        )
        .unwrap();
        assert_eq!(chunk, HostValue::Bytes(Vec::new()));
    }

    #[test]
    fn test_stat_and_exists() {
        let capability = filesystem_capability(volume());
        let stats = call(&capability, "statSync", &["/src".into()]).unwrap();
        let mode = stats.get("mode").and_then(HostValue::as_f64).unwrap() as u32;
        assert_eq!(mode & crate::vfs::S_IFMT, crate::vfs::S_IFDIR);

        assert_eq!(
            call(&capability, "existsSync", &["/src/a.txt".into()]).unwrap(),
            HostValue::Bool(true)
        );
        assert_eq!(
            call(&capability, "existsSync", &[HostValue::Null]).unwrap(),
            HostValue::Bool(false)
        );
    }

    #[test]
    fn test_mkdir_recursive_reports_first_created() {
        let capability = filesystem_capability(volume());
        let created = call(
            &capability,
            "mkdirSync",
            &["/a/b/c".into(), HostValue::from(json!({ "recursive": true }))],
        )
        .unwrap();
        assert_eq!(created, HostValue::from("/a"));
        let entries = call(&capability, "readdirSync", &["/a/b".into()]).unwrap();
        assert_eq!(entries, HostValue::from(json!(["c"])));
    }
}
