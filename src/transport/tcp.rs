use super::Transport;
use crate::error::TransportError;
use tokio::net::TcpStream;

/// Connect a plain TCP transport to `addr` (e.g. `"192.168.1.50:5555"`).
pub async fn connect_tcp(addr: &str) -> Result<Transport, TransportError> {
    log::debug!("connecting to {addr}");
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true).ok();
    Ok(Transport::Plain(stream))
}
