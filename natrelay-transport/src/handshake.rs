use crate::TransportError;
use natrelay_proto::frame::Frame;
use natrelay_proto::handshake::{Initiator, Responder, Session};
use natrelay_proto::{Keypair, PublicKey};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Listener side: only a dialer that encrypted its first message to
/// `keypair` gets a session.
pub(crate) async fn accept<S>(stream: &mut S, keypair: &Keypair) -> Result<Session, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = read_frame(stream).await?;
    let (reply, session) = Responder::new(keypair)?.respond(&hello)?;
    write_frame(stream, &reply).await?;
    Ok(session)
}

/// Dialer side: handshake with whoever holds the secret behind `expected`.
pub(crate) async fn dial<S>(stream: &mut S, expected: &PublicKey) -> Result<Session, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut initiator = Initiator::new(expected)?;
    write_frame(stream, &initiator.hello()?).await?;
    let reply = read_frame(stream).await?;
    Ok(initiator.finish(&reply)?)
}

/// Reads exactly one frame so no bytes behind it are consumed.
pub(crate) async fn read_frame<S>(stream: &mut S) -> Result<Frame, TransportError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let len = Frame::body_len(header)?;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(Frame::from_body(body)?)
}

pub(crate) async fn write_frame<S>(stream: &mut S, frame: &Frame) -> Result<(), TransportError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&frame.encode_to_vec()).await?;
    stream.flush().await?;
    Ok(())
}
