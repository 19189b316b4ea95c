//! 跨进程共享的 JSON 文档。
//!
//! 守护进程与每个扫描工作进程各自打开同一份文件；所有访问都先对旁路锁文件
//! `<path>.lock` 加 `flock(2)`，写入时先写临时文件再原子改名，读者永远看不到
//! 半截内容。锁在守卫释放（drop）时自动解除，进程崩溃时由内核回收。

use crate::error::PersistError;
use nix::fcntl::{Flock, FlockArg};
use serde::{Serialize, de::DeserializeOwned};
use std::{
    ffi::OsString,
    fs::{File, OpenOptions},
    io::{self, Write},
    marker::PhantomData,
    path::{Path, PathBuf},
};

/// 以 `flock` 串行化访问的 JSON 文档，`T` 为文档内容类型。
#[derive(Debug)]
pub struct LockedDocument<T> {
    path: PathBuf,
    lock_path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for LockedDocument<T> {
    fn clone(&self) -> Self {
        Self {
            path: self.path.clone(),
            lock_path: self.lock_path.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> LockedDocument<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = sibling(&path, ".lock");
        Self {
            path,
            lock_path,
            _marker: PhantomData,
        }
    }

    /// 在共享锁下读取文档；文件不存在或为空时返回默认值。
    pub fn read(&self) -> Result<T, PersistError> {
        let _guard = self.lock(FlockArg::LockShared)?;
        self.load()
    }

    /// 在排他锁下读取、修改并写回文档，返回闭包的结果。
    pub fn update<R>(&self, mutate: impl FnOnce(&mut T) -> R) -> Result<R, PersistError> {
        let _guard = self.lock(FlockArg::LockExclusive)?;
        let mut document = self.load()?;
        let result = mutate(&mut document);
        self.store(&document)?;
        Ok(result)
    }

    fn lock(&self, mode: FlockArg) -> Result<Flock<File>, PersistError> {
        if let Some(parent) = self.lock_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| self.io_error(source))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(|source| PersistError::Io {
                path: self.lock_path.clone(),
                source,
            })?;
        Flock::lock(file, mode).map_err(|(_, errno)| PersistError::Lock {
            path: self.lock_path.clone(),
            errno,
        })
    }

    fn load(&self) -> Result<T, PersistError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(T::default()),
            Err(source) => return Err(self.io_error(source)),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(T::default());
        }
        serde_json::from_slice(&bytes).map_err(|source| PersistError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    fn store(&self, document: &T) -> Result<(), PersistError> {
        let bytes = serde_json::to_vec_pretty(document).map_err(|source| PersistError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        let tmp = sibling(&self.path, ".tmp");
        let mut file = File::create(&tmp).map_err(|source| self.io_error(source))?;
        file.write_all(&bytes)
            .and_then(|()| file.sync_data())
            .map_err(|source| self.io_error(source))?;
        std::fs::rename(&tmp, &self.path).map_err(|source| self.io_error(source))
    }

    fn io_error(&self, source: io::Error) -> PersistError {
        PersistError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}
