//! Carries a plain byte stream over sealed records.

use crate::handshake::{read_frame, write_frame};
use crate::{PeerStream, TransportError};
use natrelay_proto::handshake::{Session, MAX_RECORD_PLAINTEXT};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};

const PIPE_CAPACITY: usize = 256 * 1024;

/// Returns the plaintext end of `stream`. A background task seals what is
/// written to it and opens what arrives from the peer. End of stream is
/// passed through in both directions.
pub(crate) fn wrap<S>(stream: S, session: Session, remote: String) -> PeerStream
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (app, plain) = tokio::io::duplex(PIPE_CAPACITY);
    tokio::spawn(pump(stream, plain, session, remote));
    Box::new(app)
}

async fn pump<S>(stream: S, plain: DuplexStream, session: Session, remote: String)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut sealer, mut opener) = session.split();
    let (mut wire_in, mut wire_out) = tokio::io::split(stream);
    let (mut plain_in, mut plain_out) = tokio::io::split(plain);

    let outbound = async {
        let mut buf = vec![0u8; MAX_RECORD_PLAINTEXT];
        loop {
            let n = plain_in.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            write_frame(&mut wire_out, &sealer.seal(&buf[..n])?).await?;
        }
        wire_out.shutdown().await?;
        Ok::<(), TransportError>(())
    };

    let inbound = async {
        let result = async {
            loop {
                let record = match read_frame(&mut wire_in).await {
                    Ok(record) => record,
                    Err(TransportError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                };
                let plaintext = opener.open(&record)?;
                plain_out.write_all(&plaintext).await?;
            }
        }
        .await;
        let _ = plain_out.shutdown().await;
        result
    };

    let (sent, received) = tokio::join!(outbound, inbound);
    if let Err(e) = received {
        log::warn!("dropping stream from {}: {}", remote, e);
    }
    if let Err(e) = sent {
        log::debug!("stream to {} ended: {}", remote, e);
    }
}
