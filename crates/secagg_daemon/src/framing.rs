//! Transport framing: length-prefixed TCP streams and chunked UDP broadcast.
//!
//! Every TCP message is a 4-byte big-endian length followed by exactly that
//! many bytes. UDP broadcast sends a length-announce datagram first, then
//! the payload in chunks of at most [`PACKET_SIZE`] bytes; there is no
//! retransmission, so a lost datagram fails the round for the receiver.

use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;

/// Maximum bytes per broadcast datagram.
pub const PACKET_SIZE: usize = 8192;

/// Maximum bytes of the broadcast length-announce datagram.
pub const ANNOUNCE_SIZE: usize = 1024;

/// Sanity cap on a single framed message (512 MiB). The wire format allows
/// up to `u32::MAX`; anything near that is a corrupt or hostile length
/// prefix and is rejected before allocation.
pub const MAX_FRAME_LEN: usize = 512 * 1024 * 1024;

/// Write one length-prefixed message.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame exceeds u32 length"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Read one length-prefixed message. A connection closing mid-frame
/// surfaces as `UnexpectedEof`.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;

    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("declared frame length {len} exceeds cap"),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Broadcast a payload: one length-announce datagram, then the payload in
/// [`PACKET_SIZE`] chunks.
pub async fn broadcast_payload(sock: &UdpSocket, target: SocketAddr, payload: &[u8]) -> io::Result<()> {
    let announce = bincode::serialize(&(payload.len() as u64))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    debug_assert!(announce.len() <= ANNOUNCE_SIZE);
    sock.send_to(&announce, target).await?;

    for chunk in payload.chunks(PACKET_SIZE) {
        sock.send_to(chunk, target).await?;
    }
    Ok(())
}

/// Receive one broadcast payload: the length announce, then datagrams until
/// the declared byte count is accumulated.
pub async fn recv_broadcast(sock: &UdpSocket) -> io::Result<Vec<u8>> {
    let mut announce = [0u8; ANNOUNCE_SIZE];
    let n = sock.recv(&mut announce).await?;
    let total: u64 = bincode::deserialize(&announce[..n])
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let total = usize::try_from(total)
        .ok()
        .filter(|&t| t <= MAX_FRAME_LEN)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "announced broadcast length exceeds cap"))?;

    let mut payload = Vec::with_capacity(total);
    let mut buf = [0u8; PACKET_SIZE];
    while payload.len() < total {
        let n = sock.recv(&mut buf).await?;
        payload.extend_from_slice(&buf[..n]);
    }

    if payload.len() != total {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "broadcast datagrams overran announced length",
        ));
    }
    Ok(payload)
}

/// Bind a UDP socket for broadcast reception with address and port reuse,
/// so several clients on one host can listen on the same broadcast port.
pub fn bind_broadcast_listener(port: u16) -> io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::from(([0, 0, 0, 0], port)).into())?;

    UdpSocket::from_std(socket.into())
}

/// Bind a UDP socket for broadcast transmission.
pub async fn bind_broadcast_sender() -> io::Result<UdpSocket> {
    let sock = UdpSocket::bind(("0.0.0.0", 0)).await?;
    sock.set_broadcast(true)?;
    Ok(sock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1 << 16);

        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        write_frame(&mut a, &payload).await.unwrap();
        let received = read_frame(&mut b).await.unwrap();

        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn empty_frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, &[]).await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(64);

        // declare 100 bytes but close after 3
        a.write_all(&100u32.to_be_bytes()).await.unwrap();
        a.write_all(&[1, 2, 3]).await.unwrap();
        drop(a);

        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn oversized_length_prefix_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn broadcast_round_trip_spans_many_datagrams() {
        let receiver = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();
        let target = receiver.local_addr().unwrap();
        let sender = UdpSocket::bind(("127.0.0.1", 0)).await.unwrap();

        let payload: Vec<u8> = (0..3 * PACKET_SIZE + 17).map(|i| (i % 256) as u8).collect();

        let recv_task = tokio::spawn(async move { recv_broadcast(&receiver).await });
        // loopback delivery is ordered in practice; give the receiver a tick
        tokio::task::yield_now().await;
        broadcast_payload(&sender, target, &payload).await.unwrap();

        let received = recv_task.await.unwrap().unwrap();
        assert_eq!(received, payload);
    }
}
