use hashbrown::HashMap;
use std::io::{self, Read};

/// Filesystem boundary: the server only needs `open(path) -> (len, reader)`.
pub trait FileSystem: Send + Sync {
    fn open(&self, path: &str) -> Option<(u64, Box<dyn Read + Send>)>;
}

/// `FileSystem` over `std::fs`.
pub struct StdFileSystem;

impl FileSystem for StdFileSystem {
    fn open(&self, path: &str) -> Option<(u64, Box<dyn Read + Send>)> {
        let file = std::fs::File::open(path).ok()?;
        let len = file.metadata().ok()?.len();
        Some((len, Box::new(file)))
    }
}

/// In-memory filesystem: backs static resources baked into the firmware and
/// the unit tests.
#[derive(Default)]
pub struct MemFileSystem {
    files: HashMap<String, Vec<u8>>,
}

impl MemFileSystem {
    pub fn new() -> MemFileSystem {
        MemFileSystem { files: HashMap::new() }
    }

    pub fn insert(&mut self, path: &str, data: Vec<u8>) {
        self.files.insert(path.to_string(), data);
    }
}

impl FileSystem for MemFileSystem {
    fn open(&self, path: &str) -> Option<(u64, Box<dyn Read + Send>)> {
        let data = self.files.get(path)?.clone();
        Some((data.len() as u64, Box::new(io::Cursor::new(data))))
    }
}

/// Sequential chunked reader over an opened file.
pub struct FileChunker {
    reader: Box<dyn Read + Send>,
    len: u64,
    pos: u64,
}

impl FileChunker {
    pub fn open(fs: &dyn FileSystem, path: &str) -> Option<FileChunker> {
        let (len, reader) = fs.open(path)?;
        Some(FileChunker { reader, len, pos: 0 })
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Read the next chunk of at most `max_len` bytes. The bool is set on
    /// the final chunk.
    pub fn next_chunk(&mut self, max_len: usize) -> io::Result<(Vec<u8>, bool)> {
        let remaining = (self.len - self.pos) as usize;
        let want = remaining.min(max_len);
        let mut chunk = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            match self.reader.read(&mut chunk[filled..]) {
                Ok(0) => break,
                Ok(count) => filled += count,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        chunk.truncate(filled);
        self.pos += filled as u64;
        let is_final = self.pos >= self.len || filled == 0;
        Ok((chunk, is_final))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_fs_open() {
        let mut fs = MemFileSystem::new();
        fs.insert("/index.html", b"<h1>hi</h1>".to_vec());
        let (len, _reader) = fs.open("/index.html").unwrap();
        assert_eq!(len, 11);
        assert!(fs.open("/missing.html").is_none());
    }

    #[test]
    fn test_chunker_sequence() {
        let mut fs = MemFileSystem::new();
        fs.insert("/data", (0..10u8).collect());
        let mut chunker = FileChunker::open(&fs, "/data").unwrap();
        assert_eq!(chunker.len(), 10);

        let (chunk, is_final) = chunker.next_chunk(4).unwrap();
        assert_eq!(chunk, vec![0, 1, 2, 3]);
        assert!(!is_final);
        let (chunk, is_final) = chunker.next_chunk(4).unwrap();
        assert_eq!(chunk, vec![4, 5, 6, 7]);
        assert!(!is_final);
        let (chunk, is_final) = chunker.next_chunk(4).unwrap();
        assert_eq!(chunk, vec![8, 9]);
        assert!(is_final);
    }

    #[test]
    fn test_chunker_single_read() {
        let mut fs = MemFileSystem::new();
        fs.insert("/small", b"abc".to_vec());
        let mut chunker = FileChunker::open(&fs, "/small").unwrap();
        let (chunk, is_final) = chunker.next_chunk(100).unwrap();
        assert_eq!(chunk, b"abc");
        assert!(is_final);
    }

    #[test]
    fn test_std_fs_roundtrip() {
        use std::io::Write;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"on disk")
            .unwrap();
        let fs = StdFileSystem;
        let mut chunker = FileChunker::open(&fs, path.to_str().unwrap()).unwrap();
        assert_eq!(chunker.len(), 7);
        let (chunk, is_final) = chunker.next_chunk(64).unwrap();
        assert_eq!(chunk, b"on disk");
        assert!(is_final);
    }
}
