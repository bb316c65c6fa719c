use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

#[derive(Debug, Clone)]
pub struct FsMetadata {
    pub is_file: bool,
    pub is_dir: bool,
    pub len: u64,
    pub modified: Option<SystemTime>,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub path: PathBuf,
    pub metadata: FsMetadata,
}

/// The filesystem seam used by the prober, the reconciliation scan, the
/// shadow archiver and the post-upload lifecycle. Keeping it behind a trait
/// lets the timing-sensitive pieces run against an in-memory filesystem in
/// tests.
pub trait FileSystem: Send + Sync {
    fn metadata(&self, path: &Path) -> io::Result<FsMetadata>;
    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>>;
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()>;
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn remove_file(&self, path: &Path) -> io::Result<()>;
    /// Stream `src` into `dst` and sync the copy to disk before returning.
    fn copy_file(&self, src: &Path, dst: &Path) -> io::Result<u64>;
}

#[derive(Debug, Default, Clone)]
pub struct RealFileSystem;

impl RealFileSystem {
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for RealFileSystem {
    fn metadata(&self, path: &Path) -> io::Result<FsMetadata> {
        let md = std::fs::metadata(path)?;
        Ok(FsMetadata {
            is_file: md.is_file(),
            is_dir: md.is_dir(),
            len: md.len(),
            modified: md.modified().ok(),
        })
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let md = entry.metadata()?;
            out.push(DirEntry {
                path: entry.path(),
                metadata: FsMetadata {
                    is_file: md.is_file(),
                    is_dir: md.is_dir(),
                    len: md.len(),
                    modified: md.modified().ok(),
                },
            });
        }
        Ok(out)
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, data)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn copy_file(&self, src: &Path, dst: &Path) -> io::Result<u64> {
        let mut source = std::fs::File::open(src)?;
        let mut dest = std::fs::File::create(dst)?;
        let mut buf = [0u8; 64 * 1024];
        let mut total = 0u64;
        loop {
            let n = source.read(&mut buf)?;
            if n == 0 {
                break;
            }
            dest.write_all(&buf[..n])?;
            total += n as u64;
        }
        dest.sync_all()?;
        Ok(total)
    }
}

/// In-memory filesystem for tests. Paths are normalized to absolute form;
/// parent directories are created implicitly on write.
#[derive(Debug, Clone, Default)]
pub struct VirtualFileSystem {
    nodes: Arc<Mutex<BTreeMap<PathBuf, Node>>>,
}

#[derive(Debug, Clone)]
enum Node {
    File { data: Vec<u8>, modified: SystemTime },
    Dir,
}

impl VirtualFileSystem {
    pub fn new() -> Self {
        let fs = Self::default();
        fs.nodes
            .lock()
            .unwrap()
            .insert(PathBuf::from("/"), Node::Dir);
        fs
    }

    /// Override a file's mtime (retention and stability tests).
    pub fn set_modified(&self, path: &Path, when: SystemTime) {
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(Node::File { modified, .. }) = nodes.get_mut(&normalize(path)) {
            *modified = when;
        }
    }

    fn insert_parents(nodes: &mut BTreeMap<PathBuf, Node>, path: &Path) {
        let mut current = PathBuf::from("/");
        for comp in path.components() {
            if let Component::Normal(c) = comp {
                current.push(c);
                nodes.entry(current.clone()).or_insert(Node::Dir);
            }
        }
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for comp in path.components() {
        match comp {
            Component::RootDir | Component::Prefix(_) => out = PathBuf::from("/"),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(c) => out.push(c),
        }
    }
    out
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("{} not found", path.display()),
    )
}

impl FileSystem for VirtualFileSystem {
    fn metadata(&self, path: &Path) -> io::Result<FsMetadata> {
        let nodes = self.nodes.lock().unwrap();
        let norm = normalize(path);
        match nodes.get(&norm) {
            Some(Node::File { data, modified }) => Ok(FsMetadata {
                is_file: true,
                is_dir: false,
                len: data.len() as u64,
                modified: Some(*modified),
            }),
            Some(Node::Dir) => Ok(FsMetadata {
                is_file: false,
                is_dir: true,
                len: 0,
                modified: None,
            }),
            None => Err(not_found(&norm)),
        }
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let nodes = self.nodes.lock().unwrap();
        let norm = normalize(path);
        match nodes.get(&norm) {
            Some(Node::Dir) => {}
            Some(_) => {
                return Err(io::Error::other(format!(
                    "{} is not a directory",
                    norm.display()
                )))
            }
            None => return Err(not_found(&norm)),
        }
        let mut out = Vec::new();
        for (p, node) in nodes.iter() {
            if p.parent() == Some(norm.as_path()) {
                let metadata = match node {
                    Node::File { data, modified } => FsMetadata {
                        is_file: true,
                        is_dir: false,
                        len: data.len() as u64,
                        modified: Some(*modified),
                    },
                    Node::Dir => FsMetadata {
                        is_file: false,
                        is_dir: true,
                        len: 0,
                        modified: None,
                    },
                };
                out.push(DirEntry {
                    path: p.clone(),
                    metadata,
                });
            }
        }
        Ok(out)
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        let nodes = self.nodes.lock().unwrap();
        let norm = normalize(path);
        match nodes.get(&norm) {
            Some(Node::File { data, .. }) => Ok(data.clone()),
            Some(Node::Dir) => Err(io::Error::other(format!(
                "{} is a directory",
                norm.display()
            ))),
            None => Err(not_found(&norm)),
        }
    }

    fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        let norm = normalize(path);
        if let Some(parent) = norm.parent() {
            Self::insert_parents(&mut nodes, parent);
        }
        nodes.insert(
            norm,
            Node::File {
                data: data.to_vec(),
                modified: SystemTime::now(),
            },
        );
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        Self::insert_parents(&mut nodes, &normalize(path));
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        let from_norm = normalize(from);
        let to_norm = normalize(to);
        if from_norm == to_norm {
            return Ok(());
        }
        let node = nodes.remove(&from_norm).ok_or_else(|| not_found(&from_norm))?;
        if let Some(parent) = to_norm.parent() {
            Self::insert_parents(&mut nodes, parent);
        }
        nodes.insert(to_norm, node);
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        let norm = normalize(path);
        match nodes.get(&norm) {
            Some(Node::File { .. }) => {
                nodes.remove(&norm);
                Ok(())
            }
            Some(Node::Dir) => Err(io::Error::other(format!(
                "{} is a directory",
                norm.display()
            ))),
            None => Err(not_found(&norm)),
        }
    }

    fn copy_file(&self, src: &Path, dst: &Path) -> io::Result<u64> {
        let data = self.read(src)?;
        let len = data.len() as u64;
        self.write(dst, &data)?;
        Ok(len)
    }
}
