// Storage seam between the protocol engine and whatever actually holds the files.
//
// The engine only needs three things: a way to resolve a filename into a handle, something to read
// from for RRQ, and something to write into for WRQ. Resolution failures are reported with one of
// the `BackendError` variants and turned into the matching TFTP error code by the server.

use crate::tftp::ErrorCode;
use std::error;
use std::fmt;
use std::future::Future;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

/// A readable handle for an outgoing transfer.
pub trait Reader: AsyncRead + Unpin + Send {
    /// Total size in bytes, if known up front. Used to answer a `tsize` request.
    fn size(&self) -> Option<u64>;
}

/// A writable handle for an incoming transfer.
pub trait Writer: AsyncWrite + Unpin + Send {
    /// Commits everything written so far. Called once, after the final block.
    fn finish(&mut self) -> impl Future<Output = io::Result<()>> + Send;

    /// Throws away whatever was written. Called when a transfer is abandoned part way.
    fn cancel(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

/// Resolves filenames to handles.
pub trait Backend: Send + Sync + 'static {
    type Reader: Reader + 'static;
    type Writer: Writer + 'static;

    fn get_reader(&self, file_name: &str) -> impl Future<Output = Result<Self::Reader, BackendError>> + Send;

    fn get_writer(&self, file_name: &str) -> impl Future<Output = Result<Self::Writer, BackendError>> + Send;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The backend doesn't do this kind of transfer at all (e.g. writes on a read-only server).
    Unsupported,
    AccessViolation,
    FileExists,
    FileNotFound,
    Other(String),
}

impl error::Error for BackendError {}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BackendError::Unsupported => f.write_str("Operation not supported"),
            BackendError::AccessViolation => f.write_str("Access violation"),
            BackendError::FileExists => f.write_str("File already exists"),
            BackendError::FileNotFound => f.write_str("File not found"),
            BackendError::Other(msg) => f.write_str(msg),
        }
    }
}

impl From<io::Error> for BackendError {
    fn from(e: io::Error) -> BackendError {
        match e.kind() {
            io::ErrorKind::NotFound => BackendError::FileNotFound,
            io::ErrorKind::PermissionDenied => BackendError::AccessViolation,
            io::ErrorKind::AlreadyExists => BackendError::FileExists,
            _ => BackendError::Other(e.to_string()),
        }
    }
}

impl From<&BackendError> for ErrorCode {
    fn from(e: &BackendError) -> ErrorCode {
        match e {
            BackendError::Unsupported => ErrorCode::Illegal,
            BackendError::AccessViolation => ErrorCode::AccessViolation,
            BackendError::FileExists => ErrorCode::FileAlreadyExists,
            BackendError::FileNotFound => ErrorCode::FileNotFound,
            BackendError::Other(_) => ErrorCode::Undefined,
        }
    }
}

///////////////////////////////////////////////////////////////
// Filesystem backend

/// Serves files from below a root directory.
#[derive(Debug, Clone)]
pub struct FilesystemBackend {
    root: PathBuf,
    can_read: bool,
    can_write: bool,
}

impl FilesystemBackend {
    pub fn new(root: impl Into<PathBuf>, can_read: bool, can_write: bool) -> FilesystemBackend {
        FilesystemBackend {
            root: root.into(),
            can_read,
            can_write,
        }
    }

    /// Maps a requested name onto a path below the root.
    ///
    /// Boot loaders send all sorts of names: DOS-style separators, absolute paths meaning "from
    /// the TFTP root". Anything that would step outside the root is refused.
    fn resolve(&self, file_name: &str) -> Result<PathBuf, BackendError> {
        let cleaned = file_name.replace('\\', "/");
        let relative = Path::new(cleaned.trim_start_matches('/'));
        let mut path = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(BackendError::AccessViolation);
                }
            }
        }
        if path == self.root {
            return Err(BackendError::FileNotFound);
        }
        Ok(path)
    }
}

impl Backend for FilesystemBackend {
    type Reader = FilesystemReader;
    type Writer = FilesystemWriter;

    async fn get_reader(&self, file_name: &str) -> Result<FilesystemReader, BackendError> {
        if !self.can_read {
            return Err(BackendError::Unsupported);
        }
        let path = self.resolve(file_name)?;
        let file = File::open(&path).await?;
        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Err(BackendError::AccessViolation);
        }
        log::debug!("Reading from {:?}", path);
        Ok(FilesystemReader {
            file,
            size: metadata.len(),
        })
    }

    async fn get_writer(&self, file_name: &str) -> Result<FilesystemWriter, BackendError> {
        if !self.can_write {
            return Err(BackendError::Unsupported);
        }
        let destination = self.resolve(file_name)?;
        if fs::try_exists(&destination).await? {
            return Err(BackendError::FileExists);
        }
        let mut temp_name = destination.clone().into_os_string();
        temp_name.push(".part");
        let temp = PathBuf::from(temp_name);
        // An existing .part file means another upload of the same name is in flight.
        let file = OpenOptions::new().write(true).create_new(true).open(&temp).await?;
        log::info!("Writing to {:?}", destination);
        Ok(FilesystemWriter {
            file,
            temp,
            destination,
            done: false,
        })
    }
}

/// A file opened for an outgoing transfer.
#[derive(Debug)]
pub struct FilesystemReader {
    file: File,
    size: u64,
}

impl AsyncRead for FilesystemReader {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_read(cx, buf)
    }
}

impl Reader for FilesystemReader {
    fn size(&self) -> Option<u64> {
        Some(self.size)
    }
}

/// An upload in progress. Data goes to `<name>.part` and only appears under the real name once the
/// transfer finishes.
#[derive(Debug)]
pub struct FilesystemWriter {
    file: File,
    temp: PathBuf,
    destination: PathBuf,
    done: bool,
}

impl AsyncWrite for FilesystemWriter {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().file).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_shutdown(cx)
    }
}

impl Writer for FilesystemWriter {
    async fn finish(&mut self) -> io::Result<()> {
        if self.done {
            return Ok(());
        }
        self.file.flush().await?;
        self.file.sync_all().await?;
        fs::rename(&self.temp, &self.destination).await?;
        self.done = true;
        Ok(())
    }

    async fn cancel(&mut self) -> io::Result<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        match fs::remove_file(&self.temp).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

///////////////////////////////////////////////////////////////
// In-memory content

/// Serves a buffer that was produced in memory, such as a generated boot configuration.
#[derive(Debug)]
pub struct BytesReader {
    data: io::Cursor<Vec<u8>>,
}

impl BytesReader {
    pub fn new(data: impl Into<Vec<u8>>) -> BytesReader {
        BytesReader {
            data: io::Cursor::new(data.into()),
        }
    }
}

impl AsyncRead for BytesReader {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().data).poll_read(cx, buf)
    }
}

impl Reader for BytesReader {
    fn size(&self) -> Option<u64> {
        Some(self.data.get_ref().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_resolve_strips_leading_separators() {
        let backend = FilesystemBackend::new("/srv/tftp", true, false);
        assert_eq!(backend.resolve("/pxelinux.0"), Ok(PathBuf::from("/srv/tftp/pxelinux.0")));
        assert_eq!(
            backend.resolve("\\EFI\\boot\\grubx64.efi"),
            Ok(PathBuf::from("/srv/tftp/EFI/boot/grubx64.efi"))
        );
        assert_eq!(backend.resolve("./a//b"), Ok(PathBuf::from("/srv/tftp/a/b")));
    }

    #[test]
    fn test_resolve_refuses_escapes() {
        let backend = FilesystemBackend::new("/srv/tftp", true, false);
        assert_eq!(backend.resolve("../etc/passwd"), Err(BackendError::AccessViolation));
        assert_eq!(backend.resolve("a/../../b"), Err(BackendError::AccessViolation));
        assert_eq!(backend.resolve("..\\secret"), Err(BackendError::AccessViolation));
        assert_eq!(backend.resolve("/"), Err(BackendError::FileNotFound));
    }

    #[tokio::test]
    async fn test_get_reader_missing_file() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let backend = FilesystemBackend::new(tmpdir.path(), true, false);
        assert_eq!(backend.get_reader("nope.txt").await.err(), Some(BackendError::FileNotFound));
    }

    #[tokio::test]
    async fn test_get_reader_reads_file() {
        let tmpdir = TempDir::new("scratch").unwrap();
        std::fs::write(tmpdir.path().join("test.txt"), b"testing").unwrap();
        let backend = FilesystemBackend::new(tmpdir.path(), true, false);

        let mut reader = assert_ok!(backend.get_reader("/test.txt").await);
        assert_eq!(reader.size(), Some(7));
        let mut contents = Vec::new();
        assert_ok!(reader.read_to_end(&mut contents).await);
        assert_eq!(contents, b"testing".to_vec());
    }

    #[tokio::test]
    async fn test_get_reader_refuses_directories() {
        let tmpdir = TempDir::new("scratch").unwrap();
        std::fs::create_dir(tmpdir.path().join("sub")).unwrap();
        let backend = FilesystemBackend::new(tmpdir.path(), true, false);
        assert_eq!(backend.get_reader("sub").await.err(), Some(BackendError::AccessViolation));
    }

    #[tokio::test]
    async fn test_disabled_operations_are_unsupported() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let backend = FilesystemBackend::new(tmpdir.path(), false, false);
        assert_eq!(backend.get_reader("a").await.err(), Some(BackendError::Unsupported));
        assert_eq!(backend.get_writer("a").await.err(), Some(BackendError::Unsupported));
    }

    #[tokio::test]
    async fn test_get_writer_refuses_existing_file() {
        let tmpdir = TempDir::new("scratch").unwrap();
        std::fs::write(tmpdir.path().join("taken"), b"x").unwrap();
        let backend = FilesystemBackend::new(tmpdir.path(), true, true);
        assert_eq!(backend.get_writer("taken").await.err(), Some(BackendError::FileExists));
    }

    #[tokio::test]
    async fn test_writer_finish_moves_file_into_place() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let backend = FilesystemBackend::new(tmpdir.path(), true, true);
        let target = tmpdir.path().join("upload.bin");

        let mut writer = assert_ok!(backend.get_writer("upload.bin").await);
        assert_ok!(writer.write_all(b"hello").await);
        assert!(!target.exists());
        assert!(tmpdir.path().join("upload.bin.part").exists());

        assert_ok!(writer.finish().await);
        assert_eq!(std::fs::read(&target).unwrap(), b"hello".to_vec());
        assert!(!tmpdir.path().join("upload.bin.part").exists());
    }

    #[tokio::test]
    async fn test_writer_cancel_discards_partial_upload() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let backend = FilesystemBackend::new(tmpdir.path(), true, true);

        let mut writer = assert_ok!(backend.get_writer("upload.bin").await);
        assert_ok!(writer.write_all(b"partial").await);
        assert_ok!(writer.cancel().await);
        assert!(!tmpdir.path().join("upload.bin").exists());
        assert!(!tmpdir.path().join("upload.bin.part").exists());
    }

    #[tokio::test]
    async fn test_concurrent_upload_of_same_name() {
        let tmpdir = TempDir::new("scratch").unwrap();
        let backend = FilesystemBackend::new(tmpdir.path(), true, true);
        let _first = assert_ok!(backend.get_writer("same").await);
        assert_err!(backend.get_writer("same").await);
    }

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(ErrorCode::from(&BackendError::Unsupported), ErrorCode::Illegal);
        assert_eq!(ErrorCode::from(&BackendError::AccessViolation), ErrorCode::AccessViolation);
        assert_eq!(ErrorCode::from(&BackendError::FileExists), ErrorCode::FileAlreadyExists);
        assert_eq!(ErrorCode::from(&BackendError::FileNotFound), ErrorCode::FileNotFound);
        assert_eq!(ErrorCode::from(&BackendError::Other("boom".into())), ErrorCode::Undefined);
    }

    #[tokio::test]
    async fn test_bytes_reader() {
        let mut reader = BytesReader::new("default menu.c32\n");
        assert_eq!(reader.size(), Some(17));
        let mut contents = String::new();
        assert_ok!(reader.read_to_string(&mut contents).await);
        assert_eq!(contents, "default menu.c32\n");
    }
}
