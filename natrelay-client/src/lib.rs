//! Client side of natrelay: dial a relay by public key and splice the
//! resulting stream onto local stdio.

use natrelay_proto::PublicKey;
use natrelay_transport::{Backoff, Connection, PeerStream, Transport};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_BACKOFF: Backoff =
    Backoff::new(Duration::from_millis(1000), Duration::from_millis(10_000), 10);

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Upper bound on one dial, handshake included.
    pub attempt_timeout: Duration,
    pub backoff: Backoff,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("could not reach {public_key} after {attempts} attempts: {last}")]
    GaveUp {
        public_key: PublicKey,
        attempts: u32,
        last: String,
    },
    #[error("relay stream failed: {0}")]
    Io(#[from] std::io::Error),
}

/// How a bridge ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// The relay closed the stream.
    RemoteClosed,
    /// Local input reached end of file.
    LocalClosed,
    Interrupted,
}

/// Dials `public_key`, retrying with capped exponential backoff until
/// `config.backoff.max_attempts` dials have failed.
pub async fn dial(
    transport: &dyn Transport,
    public_key: &PublicKey,
    config: &ConnectorConfig,
) -> Result<Connection, ConnectError> {
    let max_attempts = config.backoff.max_attempts;
    let mut last = String::from("no attempt made");
    for attempt in 1..=max_attempts {
        match tokio::time::timeout(config.attempt_timeout, transport.connect(public_key)).await {
            Ok(Ok(conn)) => {
                log::info!("connected to {} via {}", public_key, conn.remote);
                return Ok(conn);
            }
            Ok(Err(e)) => last = e.to_string(),
            Err(_) => last = format!("timed out after {:?}", config.attempt_timeout),
        }
        if attempt < max_attempts {
            let delay = config.backoff.delay(attempt - 1);
            log::warn!(
                "attempt {}/{} failed ({}); retrying in {:?}",
                attempt,
                max_attempts,
                last,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }
    Err(ConnectError::GaveUp {
        public_key: *public_key,
        attempts: max_attempts,
        last,
    })
}

/// Copies `local_in` to the relay and the relay to `local_out` until either
/// direction ends or `interrupt` resolves. Ending one direction ends both.
pub async fn bridge<I, O, F>(
    stream: PeerStream,
    mut local_in: I,
    mut local_out: O,
    interrupt: F,
) -> Result<BridgeOutcome, ConnectError>
where
    I: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
    F: Future<Output = ()>,
{
    let (mut remote_in, mut remote_out) = tokio::io::split(stream);

    let upstream = async {
        let n = tokio::io::copy(&mut local_in, &mut remote_out).await?;
        log::debug!("local input closed after {} bytes", n);
        remote_out.shutdown().await
    };
    let downstream = async {
        let n = tokio::io::copy(&mut remote_in, &mut local_out).await?;
        log::debug!("relay closed the stream after {} bytes", n);
        local_out.flush().await
    };

    let outcome = tokio::select! {
        r = upstream => {
            r?;
            BridgeOutcome::LocalClosed
        }
        r = downstream => {
            r?;
            BridgeOutcome::RemoteClosed
        }
        _ = interrupt => BridgeOutcome::Interrupted,
    };
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k9::assert_equal;
    use natrelay_proto::Keypair;
    use natrelay_transport::{Listener, MemoryTransport};
    use std::time::Instant;

    fn quick(max_attempts: u32) -> ConnectorConfig {
        ConnectorConfig {
            attempt_timeout: Duration::from_millis(200),
            backoff: Backoff::new(Duration::from_millis(10), Duration::from_millis(40), max_attempts),
        }
    }

    #[tokio::test]
    async fn gives_up_after_the_attempt_bound() {
        let transport = MemoryTransport::new();
        let key = Keypair::from_seed(b"nobody").public_key();

        let started = Instant::now();
        let err = dial(&transport, &key, &quick(3)).await.unwrap_err();
        match err {
            ConnectError::GaveUp {
                public_key,
                attempts,
                ..
            } => {
                assert_equal!(public_key, key);
                assert_equal!(attempts, 3);
            }
            other => panic!("unexpected error {other:?}"),
        }
        // Two pauses between three attempts: 10ms + 20ms.
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn retries_until_the_relay_appears() {
        let transport = MemoryTransport::new();
        let keypair = Keypair::from_seed(b"late relay");
        let key = keypair.public_key();

        let server = {
            let transport = transport.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                let mut listener = transport.listen(&keypair).await.unwrap();
                let conn = listener.accept().await.unwrap().unwrap();
                (listener, conn)
            })
        };

        let conn = dial(&transport, &key, &quick(10)).await.unwrap();
        assert!(conn.remote.contains(&key.to_hex()));
        let (mut listener, _conn) = server.await.unwrap();
        listener.close().await;
    }
}
