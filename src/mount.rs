//! Mount Facade — adapts the Read Path to `fuser::Filesystem`.
//!
//! Inode numbers are assigned lazily: inode 1 is always the synthesized
//! root, and every other inode is handed out the first time `lookup` or
//! `readdir` sees a `(parent_path, name)` pair, then cached for the rest of
//! the mount's lifetime. Write bits are cleared from every returned mode
//! here, not in the Read Path, since "no write support" is a property of
//! the filesystem binding, not of the archive data itself.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, Request};
use libc::{EINVAL, ENOENT};

use crate::config::MountConfig;
use crate::index_store::MemberRecord;
use crate::indexer::normalize_path;
use crate::read_path::ReadPath;
use crate::tar_scanner::{TYPE_BLK, TYPE_CHR, TYPE_DIR, TYPE_FIFO, TYPE_SYMLINK};

const ATTR_TTL: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        format!("/{name}")
    } else {
        format!("{path}/{name}")
    }
}

fn type_to_filetype(typeflag: u8) -> FileType {
    match typeflag {
        TYPE_DIR => FileType::Directory,
        TYPE_SYMLINK => FileType::Symlink,
        TYPE_CHR => FileType::CharDevice,
        TYPE_BLK => FileType::BlockDevice,
        TYPE_FIFO => FileType::NamedPipe,
        _ => FileType::RegularFile,
    }
}

fn system_time_from_unix_secs(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs((-secs) as u64)
    }
}

/// Lazily-built bidirectional map between inode numbers and the
/// `(parent_path, name)` pairs the Index Store addresses entries by.
#[derive(Default)]
struct InodeTable {
    next_ino: u64,
    path_to_ino: HashMap<(String, String), u64>,
    ino_to_entry: HashMap<u64, (String, String)>,
    ino_to_parent: HashMap<u64, u64>,
}

impl InodeTable {
    fn new() -> Self {
        Self { next_ino: 2, ..Default::default() }
    }

    fn get_or_create(&mut self, parent_ino: u64, parent_path: &str, name: &str) -> u64 {
        let key = (parent_path.to_string(), name.to_string());
        if let Some(&ino) = self.path_to_ino.get(&key) {
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.path_to_ino.insert(key.clone(), ino);
        self.ino_to_entry.insert(ino, key);
        self.ino_to_parent.insert(ino, parent_ino);
        ino
    }

    fn entry(&self, ino: u64) -> Option<(String, String)> {
        if ino == ROOT_INO {
            return None;
        }
        self.ino_to_entry.get(&ino).cloned()
    }

    fn parent_of(&self, ino: u64) -> u64 {
        self.ino_to_parent.get(&ino).copied().unwrap_or(ROOT_INO)
    }
}

pub struct TarFs {
    read_path: ReadPath,
    /// The Index Store `path` value root children are listed under —
    /// `""` unless `-p/--prefix` restricts the mount to a subtree.
    root_path: String,
    archive_mtime: i64,
    inodes: InodeTable,
}

impl TarFs {
    pub fn new(read_path: ReadPath, archive_mtime: i64, config: &MountConfig) -> Self {
        let root_path = config
            .prefix
            .as_ref()
            .map(|p| normalize_path("", &p.to_string_lossy()))
            .unwrap_or_default();
        Self { read_path, root_path, archive_mtime, inodes: InodeTable::new() }
    }

    fn dir_path_for_ino(&self, ino: u64) -> Option<String> {
        if ino == ROOT_INO {
            return Some(self.root_path.clone());
        }
        let (path, name) = self.inodes.entry(ino)?;
        Some(join(&path, &name))
    }

    fn root_attr(&self) -> FileAttr {
        let mtime = system_time_from_unix_secs(self.archive_mtime);
        FileAttr {
            ino: ROOT_INO,
            size: 0,
            blocks: 0,
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind: FileType::Directory,
            perm: 0o555,
            nlink: 2,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }

    fn file_attr(&self, ino: u64, member: &MemberRecord) -> FileAttr {
        let kind = type_to_filetype(member.type_ as u8);
        let perm = (member.mode as u32 & 0o7777 & !0o222) as u16;
        let size = member.size.max(0) as u64;
        let mtime = system_time_from_unix_secs(member.mtime);
        FileAttr {
            ino,
            size,
            blocks: (size + 511) / 512,
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind,
            perm,
            nlink: 1,
            uid: member.uid as u32,
            gid: member.gid as u32,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }
}

impl Filesystem for TarFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name_str = match name.to_str() {
            Some(s) => s,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        let parent_path = match self.dir_path_for_ino(parent) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        match self.read_path.resolve(&parent_path, name_str) {
            Ok(member) => {
                let ino = self.inodes.get_or_create(parent, &parent_path, name_str);
                let attr = self.file_attr(ino, &member);
                reply.entry(&ATTR_TTL, &attr, 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        if ino == ROOT_INO {
            reply.attr(&ATTR_TTL, &self.root_attr());
            return;
        }
        let (path, name) = match self.inodes.entry(ino) {
            Some(e) => e,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        match self.read_path.resolve(&path, &name) {
            Ok(member) => reply.attr(&ATTR_TTL, &self.file_attr(ino, &member)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let (path, name) = match self.inodes.entry(ino) {
            Some(e) => e,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        match self.read_path.readlink(&path, &name) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let (path, name) = match self.inodes.entry(ino) {
            Some(e) => e,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        let offset = offset.max(0) as u64;
        match self.read_path.read(&path, &name, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn release(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, _lock_owner: Option<u64>, _flush: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let dir_path = match self.dir_path_for_ino(ino) {
            Some(p) => p,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        let parent_ino = if ino == ROOT_INO { ROOT_INO } else { self.inodes.parent_of(ino) };

        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        match self.read_path.readdir(&dir_path) {
            Ok(members) => {
                for m in members {
                    let child_ino = self.inodes.get_or_create(ino, &dir_path, &m.name);
                    entries.push((child_ino, type_to_filetype(m.type_ as u8), m.name));
                }
            }
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        }

        for (i, (entry_ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            let next_offset = (i + 1) as i64;
            if reply.add(entry_ino, next_offset, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }
}
