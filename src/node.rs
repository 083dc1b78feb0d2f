//! Host-facing node model: a flat root directory of block files.

use std::collections::BTreeMap;

use anyhow::Result;
use nix::errno::Errno;
use tracing::debug;

use crate::file::{Backend, File, FileOps};
use crate::types::{FileMeta, LockLevel, SetAttr};
use crate::util::anyhow_errno;

pub const ROOT: &str = "/";

const DIR_MODE: u32 = 0o040_755;

/// Operations the host filesystem adapter issues against any node.
pub trait NodeOps {
    fn getattr(&self) -> FileMeta;

    fn setattr(&mut self, attr: SetAttr) -> Result<()>;

    fn read(&mut self, dst: &mut [u8], offset: usize, length: usize, position: i64)
        -> Result<usize>;

    fn write(&mut self, src: &[u8], offset: usize, length: usize, position: i64) -> Result<usize>;

    fn lock(&mut self, level: LockLevel) -> Result<bool>;

    fn unlock(&mut self, level: LockLevel) -> Result<bool>;

    fn fsync(&mut self) -> Result<()>;

    fn delete(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    mode: u32,
}

impl Default for Directory {
    fn default() -> Self {
        Self { mode: DIR_MODE }
    }
}

fn dir_error() -> anyhow::Error {
    anyhow_errno(Errno::EISDIR, "operation not supported on a directory")
}

impl NodeOps for Directory {
    fn getattr(&self) -> FileMeta {
        FileMeta {
            size: 0,
            block_size: None,
            mode: Some(self.mode),
        }
    }

    fn setattr(&mut self, attr: SetAttr) -> Result<()> {
        if attr.size.is_some() || attr.block_size.is_some() {
            return Err(dir_error());
        }
        if let Some(mode) = attr.mode {
            self.mode = mode;
        }
        Ok(())
    }

    fn read(&mut self, _: &mut [u8], _: usize, _: usize, _: i64) -> Result<usize> {
        Err(dir_error())
    }

    fn write(&mut self, _: &[u8], _: usize, _: usize, _: i64) -> Result<usize> {
        Err(dir_error())
    }

    fn lock(&mut self, _: LockLevel) -> Result<bool> {
        Err(dir_error())
    }

    fn unlock(&mut self, _: LockLevel) -> Result<bool> {
        Err(dir_error())
    }

    fn fsync(&mut self) -> Result<()> {
        Ok(())
    }

    fn delete(&mut self) -> Result<()> {
        Err(dir_error())
    }
}

impl<O: FileOps> NodeOps for File<O> {
    fn getattr(&self) -> FileMeta {
        File::getattr(self).clone()
    }

    fn setattr(&mut self, attr: SetAttr) -> Result<()> {
        File::setattr(self, attr)
    }

    fn read(
        &mut self,
        dst: &mut [u8],
        offset: usize,
        length: usize,
        position: i64,
    ) -> Result<usize> {
        File::read(self, dst, offset, length, position)
    }

    fn write(&mut self, src: &[u8], offset: usize, length: usize, position: i64) -> Result<usize> {
        File::write(self, src, offset, length, position)
    }

    fn lock(&mut self, level: LockLevel) -> Result<bool> {
        File::lock(self, level)
    }

    fn unlock(&mut self, level: LockLevel) -> Result<bool> {
        File::unlock(self, level)
    }

    fn fsync(&mut self) -> Result<()> {
        File::fsync(self)
    }

    fn delete(&mut self) -> Result<()> {
        File::delete(self)
    }
}

pub enum Node<O: FileOps> {
    Directory(Directory),
    RegularFile(File<O>),
}

impl<O: FileOps> Node<O> {
    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Directory(_))
    }

    pub fn as_file_mut(&mut self) -> Option<&mut File<O>> {
        match self {
            Self::RegularFile(file) => Some(file),
            Self::Directory(_) => None,
        }
    }

    fn ops(&self) -> &dyn NodeOps {
        match self {
            Self::Directory(dir) => dir,
            Self::RegularFile(file) => file,
        }
    }

    fn ops_mut(&mut self) -> &mut dyn NodeOps {
        match self {
            Self::Directory(dir) => dir,
            Self::RegularFile(file) => file,
        }
    }
}

impl<O: FileOps> NodeOps for Node<O> {
    fn getattr(&self) -> FileMeta {
        self.ops().getattr()
    }

    fn setattr(&mut self, attr: SetAttr) -> Result<()> {
        self.ops_mut().setattr(attr)
    }

    fn read(
        &mut self,
        dst: &mut [u8],
        offset: usize,
        length: usize,
        position: i64,
    ) -> Result<usize> {
        self.ops_mut().read(dst, offset, length, position)
    }

    fn write(&mut self, src: &[u8], offset: usize, length: usize, position: i64) -> Result<usize> {
        self.ops_mut().write(src, offset, length, position)
    }

    fn lock(&mut self, level: LockLevel) -> Result<bool> {
        self.ops_mut().lock(level)
    }

    fn unlock(&mut self, level: LockLevel) -> Result<bool> {
        self.ops_mut().unlock(level)
    }

    fn fsync(&mut self) -> Result<()> {
        self.ops_mut().fsync()
    }

    fn delete(&mut self) -> Result<()> {
        self.ops_mut().delete()
    }
}

/// Root directory plus the files opened under it. Names are flat.
pub struct Namespace<B: Backend> {
    backend: B,
    root: Node<B::Ops>,
    files: BTreeMap<String, Node<B::Ops>>,
}

impl<B: Backend> Namespace<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            root: Node::Directory(Directory::default()),
            files: BTreeMap::new(),
        }
    }

    /// Opens `name`, creating the node on first use. Each call takes one
    /// open handle on the file.
    pub fn create(&mut self, name: &str) -> Result<&mut Node<B::Ops>> {
        if name.is_empty() || name == ROOT || name.contains('/') {
            return Err(anyhow_errno(
                Errno::EINVAL,
                format!("invalid file name {name:?}"),
            ));
        }
        let backend = &self.backend;
        let node = self.files.entry(name.to_owned()).or_insert_with(|| {
            debug!(name = %name, "creating file node");
            Node::RegularFile(File::new(name, backend.create_file(name)))
        });
        if let Some(file) = node.as_file_mut() {
            file.open()?;
        }
        Ok(node)
    }

    pub fn lookup(&mut self, name: &str) -> Option<&mut Node<B::Ops>> {
        if name == ROOT {
            return Some(&mut self.root);
        }
        self.files.get_mut(name)
    }

    /// Deletes the file from the backend and forgets its node.
    pub fn unlink(&mut self, name: &str) -> Result<()> {
        if name == ROOT {
            return Err(dir_error());
        }
        let mut node = self
            .files
            .remove(name)
            .ok_or_else(|| anyhow_errno(Errno::ENOENT, format!("no such file {name:?}")))?;
        node.delete()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }
}
