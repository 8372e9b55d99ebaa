use tokio::net::TcpListener;

/// Ask the OS for a free local TCP port.
///
/// The listener is dropped before returning, so the port is only free until
/// someone else binds it. The tunnel binds it right after.
pub async fn reserve_local_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    Ok(listener.local_addr()?.port())
}
