//! The SYNC sub-protocol: `STAT`/`LIST`/`SEND`/`RECV`/`QUIT` framed over a
//! stream opened to `sync:`.

use crate::error::{StreamError, SyncError};
use crate::stream::Stream;
use byteorder::{ByteOrder, LittleEndian};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum size of a single `DATA` chunk, per the sub-protocol's own limit
/// (independent of the transport's `max_payload`).
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

const ID_STAT: [u8; 4] = *b"STAT";
const ID_LIST: [u8; 4] = *b"LIST";
const ID_SEND: [u8; 4] = *b"SEND";
const ID_RECV: [u8; 4] = *b"RECV";
const ID_QUIT: [u8; 4] = *b"QUIT";
const ID_DENT: [u8; 4] = *b"DENT";
const ID_DATA: [u8; 4] = *b"DATA";
const ID_DONE: [u8; 4] = *b"DONE";
const ID_FAIL: [u8; 4] = *b"FAIL";
const ID_OKAY: [u8; 4] = *b"OKAY";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileStat {
    pub mode: u32,
    pub size: u32,
    pub mtime: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dirent {
    pub mode: u32,
    pub size: u32,
    pub mtime: u32,
    pub name: String,
}

/// A progress callback invoked after each chunk is sent or received, with
/// the cumulative byte count transferred so far.
pub type ProgressFn<'a> = dyn FnMut(u64) + Send + 'a;

/// An adapter driving the SYNC sub-protocol over a single opened stream.
pub struct Sync {
    stream: Stream,
}

impl Sync {
    /// Open a `sync:` session on `connection`.
    pub async fn open(connection: &crate::Connection) -> Result<Self, StreamError> {
        let stream = connection.open("sync:").await?;
        Ok(Sync { stream })
    }

    pub fn from_stream(stream: Stream) -> Self {
        Sync { stream }
    }

    async fn send_frame(&mut self, id: [u8; 4], arg: u32) -> Result<(), SyncError> {
        let mut frame = [0u8; 8];
        frame[0..4].copy_from_slice(&id);
        LittleEndian::write_u32(&mut frame[4..8], arg);
        self.stream.write(&frame).await?;
        Ok(())
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), SyncError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.stream.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(SyncError::Stream(StreamError::StreamClosed));
            }
            filled += n;
        }
        Ok(())
    }

    async fn read_id(&mut self) -> Result<[u8; 4], SyncError> {
        let mut id = [0u8; 4];
        self.read_exact(&mut id).await?;
        Ok(id)
    }

    async fn read_fail(&mut self) -> Result<SyncError, SyncError> {
        let mut len_buf = [0u8; 4];
        self.read_exact(&mut len_buf).await?;
        let len = LittleEndian::read_u32(&len_buf) as usize;
        let mut msg = vec![0u8; len];
        self.read_exact(&mut msg).await?;
        Ok(SyncError::SyncFail(String::from_utf8_lossy(&msg).into_owned()))
    }

    /// `STAT name` — returns the remote file's mode, size, and mtime.
    pub async fn stat(&mut self, path: &str) -> Result<FileStat, SyncError> {
        self.send_frame(ID_STAT, path.len() as u32).await?;
        self.stream.write(path.as_bytes()).await?;

        let id = self.read_id().await?;
        if id != ID_STAT {
            return Err(SyncError::UnexpectedFrame(String::from_utf8_lossy(&id).into_owned()));
        }
        let mut body = [0u8; 12];
        self.read_exact(&mut body).await?;
        Ok(FileStat {
            mode: LittleEndian::read_u32(&body[0..4]),
            size: LittleEndian::read_u32(&body[4..8]),
            mtime: LittleEndian::read_u32(&body[8..12]),
        })
    }

    /// `LIST name` — returns every directory entry, excluding the
    /// terminating `DONE` marker.
    pub async fn list(&mut self, path: &str) -> Result<Vec<Dirent>, SyncError> {
        self.send_frame(ID_LIST, path.len() as u32).await?;
        self.stream.write(path.as_bytes()).await?;

        let mut entries = Vec::new();
        loop {
            let id = self.read_id().await?;
            if id == ID_DONE {
                let mut padding = [0u8; 16];
                self.read_exact(&mut padding).await?;
                return Ok(entries);
            }
            if id != ID_DENT {
                return Err(SyncError::UnexpectedFrame(String::from_utf8_lossy(&id).into_owned()));
            }
            let mut body = [0u8; 16];
            self.read_exact(&mut body).await?;
            let mode = LittleEndian::read_u32(&body[0..4]);
            let size = LittleEndian::read_u32(&body[4..8]);
            let mtime = LittleEndian::read_u32(&body[8..12]);
            let name_len = LittleEndian::read_u32(&body[12..16]) as usize;
            let mut name_bytes = vec![0u8; name_len];
            self.read_exact(&mut name_bytes).await?;
            entries.push(Dirent { mode, size, mtime, name: String::from_utf8_lossy(&name_bytes).into_owned() });
        }
    }

    /// `SEND path,mode` — uploads the full contents of `data`, chunked to
    /// at most [`MAX_CHUNK_SIZE`] bytes, with `mtime` as the terminal
    /// modification time (seconds since epoch).
    pub async fn send(&mut self, remote_path: &str, mode: u32, mtime: u32, data: &[u8]) -> Result<(), SyncError> {
        self.send_with_progress(remote_path, mode, mtime, data, None).await
    }

    pub async fn send_with_progress(
        &mut self,
        remote_path: &str,
        mode: u32,
        mtime: u32,
        data: &[u8],
        mut progress: Option<&mut ProgressFn<'_>>,
    ) -> Result<(), SyncError> {
        let info = format!("{remote_path},{mode}");
        self.send_frame(ID_SEND, info.len() as u32).await?;
        self.stream.write(info.as_bytes()).await?;

        let mut sent: u64 = 0;
        for chunk in data.chunks(MAX_CHUNK_SIZE) {
            self.send_frame(ID_DATA, chunk.len() as u32).await?;
            self.stream.write(chunk).await?;
            sent += chunk.len() as u64;
            if let Some(cb) = progress.as_deref_mut() {
                cb(sent);
            }
        }
        self.send_frame(ID_DONE, mtime).await?;

        let id = self.read_id().await?;
        if id == ID_OKAY {
            Ok(())
        } else if id == ID_FAIL {
            Err(self.read_fail().await?)
        } else {
            Err(SyncError::UnexpectedFrame(String::from_utf8_lossy(&id).into_owned()))
        }
    }

    /// `SEND path,mode` — uploads from an arbitrary `AsyncRead`, streaming
    /// chunks of at most [`MAX_CHUNK_SIZE`] bytes without holding the whole
    /// transfer in memory at once. Used by [`Sync::send_file`] and by
    /// callers piping in data from something other than a local file.
    pub async fn send_reader_with_progress<R: AsyncRead + Unpin>(
        &mut self,
        remote_path: &str,
        mode: u32,
        mtime: u32,
        mut reader: R,
        mut progress: Option<&mut ProgressFn<'_>>,
    ) -> Result<(), SyncError> {
        let info = format!("{remote_path},{mode}");
        self.send_frame(ID_SEND, info.len() as u32).await?;
        self.stream.write(info.as_bytes()).await?;

        let mut sent: u64 = 0;
        let mut buf = vec![0u8; MAX_CHUNK_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            self.send_frame(ID_DATA, n as u32).await?;
            self.stream.write(&buf[..n]).await?;
            sent += n as u64;
            if let Some(cb) = progress.as_deref_mut() {
                cb(sent);
            }
        }
        self.send_frame(ID_DONE, mtime).await?;

        let id = self.read_id().await?;
        if id == ID_OKAY {
            Ok(())
        } else if id == ID_FAIL {
            Err(self.read_fail().await?)
        } else {
            Err(SyncError::UnexpectedFrame(String::from_utf8_lossy(&id).into_owned()))
        }
    }

    /// `SEND path,mode` — uploads the contents of a local file, read
    /// directly off disk rather than staged into a `Vec<u8>` first.
    pub async fn send_file(&mut self, local_path: &Path, remote_path: &str, mode: u32, mtime: u32) -> Result<(), SyncError> {
        let file = tokio::fs::File::open(local_path).await?;
        self.send_reader_with_progress(remote_path, mode, mtime, file, None).await
    }

    /// `RECV name` — downloads the full contents of a remote file.
    pub async fn recv(&mut self, remote_path: &str) -> Result<Vec<u8>, SyncError> {
        self.recv_with_progress(remote_path, None).await
    }

    pub async fn recv_with_progress(
        &mut self,
        remote_path: &str,
        mut progress: Option<&mut ProgressFn<'_>>,
    ) -> Result<Vec<u8>, SyncError> {
        self.send_frame(ID_RECV, remote_path.len() as u32).await?;
        self.stream.write(remote_path.as_bytes()).await?;

        let mut out = Vec::new();
        loop {
            let id = self.read_id().await?;
            if id == ID_DONE {
                let mut arg = [0u8; 4];
                self.read_exact(&mut arg).await?;
                return Ok(out);
            }
            if id == ID_FAIL {
                return Err(self.read_fail().await?);
            }
            if id != ID_DATA {
                return Err(SyncError::UnexpectedFrame(String::from_utf8_lossy(&id).into_owned()));
            }
            let mut len_buf = [0u8; 4];
            self.read_exact(&mut len_buf).await?;
            let len = LittleEndian::read_u32(&len_buf) as usize;
            if len > MAX_CHUNK_SIZE {
                return Err(SyncError::Protocol(crate::error::ProtocolError::PayloadTooLarge { len, max: MAX_CHUNK_SIZE }));
            }
            let mut chunk = vec![0u8; len];
            self.read_exact(&mut chunk).await?;
            out.extend_from_slice(&chunk);
            if let Some(cb) = progress.as_deref_mut() {
                cb(out.len() as u64);
            }
        }
    }

    /// `RECV name` — downloads a remote file straight into an arbitrary
    /// `AsyncWrite`, without holding the whole transfer in memory.
    pub async fn recv_to_writer_with_progress<W: AsyncWrite + Unpin>(
        &mut self,
        remote_path: &str,
        writer: &mut W,
        mut progress: Option<&mut ProgressFn<'_>>,
    ) -> Result<(), SyncError> {
        self.send_frame(ID_RECV, remote_path.len() as u32).await?;
        self.stream.write(remote_path.as_bytes()).await?;

        let mut received: u64 = 0;
        loop {
            let id = self.read_id().await?;
            if id == ID_DONE {
                let mut arg = [0u8; 4];
                self.read_exact(&mut arg).await?;
                return Ok(());
            }
            if id == ID_FAIL {
                return Err(self.read_fail().await?);
            }
            if id != ID_DATA {
                return Err(SyncError::UnexpectedFrame(String::from_utf8_lossy(&id).into_owned()));
            }
            let mut len_buf = [0u8; 4];
            self.read_exact(&mut len_buf).await?;
            let len = LittleEndian::read_u32(&len_buf) as usize;
            if len > MAX_CHUNK_SIZE {
                return Err(SyncError::Protocol(crate::error::ProtocolError::PayloadTooLarge { len, max: MAX_CHUNK_SIZE }));
            }
            let mut chunk = vec![0u8; len];
            self.read_exact(&mut chunk).await?;
            writer.write_all(&chunk).await?;
            received += chunk.len() as u64;
            if let Some(cb) = progress.as_deref_mut() {
                cb(received);
            }
        }
    }

    /// `RECV name` — downloads a remote file directly to a local path.
    pub async fn recv_to_file(&mut self, remote_path: &str, local_path: &Path) -> Result<(), SyncError> {
        let mut file = tokio::fs::File::create(local_path).await?;
        self.recv_to_writer_with_progress(remote_path, &mut file, None).await
    }

    /// `QUIT` — ends the sync session and closes the underlying stream.
    pub async fn quit(mut self) -> Result<(), StreamError> {
        self.send_frame(ID_QUIT, 0).await.map_err(|_| StreamError::StreamClosed)?;
        self.stream.close().await
    }
}
