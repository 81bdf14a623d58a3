//! The Shell v2 sub-protocol (typed stdin/stdout/stderr/exit frames), with
//! a v1 fallback (`shell:<cmd>`, merged stdout/stderr, no exit code) for
//! peers that don't advertise `shell_v2`.

use crate::error::{ShellError, StreamError};
use crate::stream::{Stream, StreamReadHalf, StreamWriteHalf};
use byteorder::{ByteOrder, LittleEndian};
use tokio::sync::{mpsc, oneshot};

const ID_STDIN: u8 = 0;
const ID_STDOUT: u8 = 1;
const ID_STDERR: u8 = 2;
const ID_EXIT: u8 = 3;
const ID_CLOSE_STDIN: u8 = 4;
const ID_WINDOW_SIZE: u8 = 5;

/// The outcome of a non-interactive [`Shell::exec`].
#[derive(Debug, Default, Clone)]
pub struct ShellResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` when the v1 fallback was used (the protocol doesn't carry
    /// an exit code in that mode).
    pub exit_code: Option<u8>,
}

/// Entry point for running shell commands on a connection.
pub struct Shell;

impl Shell {
    /// Run `cmd` to completion and collect its output. Uses Shell v2
    /// framing when the peer advertises `shell_v2`, otherwise falls back
    /// to the unframed v1 protocol with stdout/stderr merged.
    pub async fn exec(connection: &crate::Connection, cmd: &str) -> Result<ShellResult, ShellError> {
        if connection.supports("shell_v2") {
            exec_v2(connection, cmd).await
        } else {
            exec_v1(connection, cmd).await
        }
    }

    /// Open an interactive duplex shell session (`shell_v2` only).
    pub async fn interactive(connection: &crate::Connection, cmd: Option<&str>) -> Result<ShellSession, ShellError> {
        let destination = format!("shell,v2,raw:{}", cmd.unwrap_or(""));
        let stream = connection.open(&destination).await?;
        Ok(ShellSession::spawn(stream))
    }
}

async fn exec_v2(connection: &crate::Connection, cmd: &str) -> Result<ShellResult, ShellError> {
    let destination = format!("shell,v2,raw:{cmd}");
    let mut stream = connection.open(&destination).await?;

    let mut result = ShellResult::default();
    loop {
        let Some((id, payload)) = read_frame(&mut stream).await? else {
            break;
        };
        match id {
            ID_STDOUT => result.stdout.extend_from_slice(&payload),
            ID_STDERR => result.stderr.extend_from_slice(&payload),
            ID_EXIT => {
                result.exit_code = payload.first().copied();
                break;
            }
            other => log::debug!("ignoring shell v2 frame id {other}"),
        }
    }
    Ok(result)
}

async fn exec_v1(connection: &crate::Connection, cmd: &str) -> Result<ShellResult, ShellError> {
    let destination = format!("shell:{cmd}");
    let mut stream = connection.open(&destination).await?;
    let merged = stream.read_to_end().await?;
    Ok(ShellResult { stdout: merged, stderr: Vec::new(), exit_code: None })
}

async fn read_frame(stream: &mut Stream) -> Result<Option<(u8, Vec<u8>)>, StreamError> {
    let mut id_buf = [0u8; 1];
    if !read_exact_or_eof(stream, &mut id_buf).await? {
        return Ok(None);
    }
    let mut len_buf = [0u8; 4];
    read_exact(stream, &mut len_buf).await?;
    let len = LittleEndian::read_u32(&len_buf) as usize;
    let mut payload = vec![0u8; len];
    read_exact(stream, &mut payload).await?;
    Ok(Some((id_buf[0], payload)))
}

async fn read_exact(stream: &mut Stream, buf: &mut [u8]) -> Result<(), StreamError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(StreamError::StreamClosed);
        }
        filled += n;
    }
    Ok(())
}

async fn read_exact_or_eof(stream: &mut Stream, buf: &mut [u8]) -> Result<bool, StreamError> {
    let n = stream.read(buf).await?;
    if n == 0 {
        return Ok(false);
    }
    let mut filled = n;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(StreamError::StreamClosed);
        }
        filled += n;
    }
    Ok(true)
}

fn encode_frame(id: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + payload.len());
    out.push(id);
    let mut len_buf = [0u8; 4];
    LittleEndian::write_u32(&mut len_buf, payload.len() as u32);
    out.extend_from_slice(&len_buf);
    out.extend_from_slice(payload);
    out
}

/// An open interactive Shell v2 session: duplex stdin, and separate
/// `stdout`/`stderr` byte channels drained by a background task.
pub struct ShellSession {
    write_half: StreamWriteHalf,
    stdout_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    stderr_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    exit_rx: Option<oneshot::Receiver<u8>>,
}

impl ShellSession {
    fn spawn(stream: Stream) -> Self {
        let (mut read_half, write_half) = stream.split();
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        tokio::spawn(async move {
            let mut exit_tx = Some(exit_tx);
            loop {
                let mut id_buf = [0u8; 1];
                if !read_half_exact_or_eof(&mut read_half, &mut id_buf).await.unwrap_or(false) {
                    break;
                }
                let mut len_buf = [0u8; 4];
                if read_half_exact(&mut read_half, &mut len_buf).await.is_err() {
                    break;
                }
                let len = LittleEndian::read_u32(&len_buf) as usize;
                let mut payload = vec![0u8; len];
                if read_half_exact(&mut read_half, &mut payload).await.is_err() {
                    break;
                }
                match id_buf[0] {
                    ID_STDOUT => {
                        let _ = stdout_tx.send(payload);
                    }
                    ID_STDERR => {
                        let _ = stderr_tx.send(payload);
                    }
                    ID_EXIT => {
                        if let Some(tx) = exit_tx.take() {
                            let _ = tx.send(payload.first().copied().unwrap_or(0));
                        }
                        break;
                    }
                    other => log::debug!("ignoring shell v2 frame id {other}"),
                }
            }
        });

        ShellSession { write_half, stdout_rx, stderr_rx, exit_rx: Some(exit_rx) }
    }

    pub async fn write_stdin(&mut self, data: &[u8]) -> Result<(), ShellError> {
        self.write_half.write(&encode_frame(ID_STDIN, data)).await?;
        Ok(())
    }

    pub async fn close_stdin(&mut self) -> Result<(), ShellError> {
        self.write_half.write(&encode_frame(ID_CLOSE_STDIN, &[])).await?;
        Ok(())
    }

    /// Notify the peer of a terminal resize: `cols`/`rows` in characters,
    /// `x_pixels`/`y_pixels` in pixels (0 if unknown).
    pub async fn resize(&mut self, cols: u16, rows: u16, x_pixels: u16, y_pixels: u16) -> Result<(), ShellError> {
        let payload = format!("{rows},{cols},{x_pixels},{y_pixels}\0");
        self.write_half.write(&encode_frame(ID_WINDOW_SIZE, payload.as_bytes())).await?;
        Ok(())
    }

    /// Receive the next chunk of stdout, or `None` once the session has
    /// no more to deliver.
    pub async fn read_stdout(&mut self) -> Option<Vec<u8>> {
        self.stdout_rx.recv().await
    }

    pub async fn read_stderr(&mut self) -> Option<Vec<u8>> {
        self.stderr_rx.recv().await
    }

    /// Await the process's exit code. Resolves once, after which the
    /// session's read side is done.
    pub async fn wait(&mut self) -> Option<u8> {
        match self.exit_rx.take() {
            Some(rx) => rx.await.ok(),
            None => None,
        }
    }
}

async fn read_half_exact(half: &mut StreamReadHalf, buf: &mut [u8]) -> Result<(), StreamError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = half.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(StreamError::StreamClosed);
        }
        filled += n;
    }
    Ok(())
}

async fn read_half_exact_or_eof(half: &mut StreamReadHalf, buf: &mut [u8]) -> Result<bool, StreamError> {
    let n = half.read(buf).await?;
    if n == 0 {
        return Ok(false);
    }
    let mut filled = n;
    while filled < buf.len() {
        let n = half.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(StreamError::StreamClosed);
        }
        filled += n;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_encoding_matches_id_plus_length_plus_payload() {
        let frame = encode_frame(ID_STDIN, b"abc");
        assert_eq!(frame[0], ID_STDIN);
        assert_eq!(LittleEndian::read_u32(&frame[1..5]), 3);
        assert_eq!(&frame[5..], b"abc");
    }
}
