//! Management console over TCP.
//!
//! Each connection runs on its own task and forwards commands to the
//! aggregation worker, which owns all state the commands touch.

pub mod command;

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::export::health::HealthMetrics;

pub use self::command::{execute, Command, ConsoleState};

/// A command waiting to be executed by the worker.
#[derive(Debug)]
pub struct ConsoleRequest {
    pub command: Command,
    pub reply: oneshot::Sender<String>,
}

/// Accepts console connections until cancelled.
pub async fn serve(
    listener: TcpListener,
    requests: mpsc::Sender<ConsoleRequest>,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "console connection opened");
                health.console_connections.inc();
                tokio::spawn(handle_connection(
                    stream,
                    requests.clone(),
                    Arc::clone(&health),
                    cancel.clone(),
                ));
            }
            Err(e) => warn!(error = %e, "accepting console connection"),
        }
    }
}

/// Reads commands line by line and writes each response back.
///
/// The connection closes on `quit`, EOF, a transport error, or when the
/// worker has gone away.
async fn handle_connection(
    stream: TcpStream,
    requests: mpsc::Sender<ConsoleRequest>,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = lines.next_line() => next,
        };

        let line = match next {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "reading console command");
                break;
            }
        };

        let command = Command::parse(&line);
        health
            .console_commands
            .with_label_values(&[command.name()])
            .inc();

        if command == Command::Quit {
            break;
        }

        let (reply, response) = oneshot::channel();
        if requests.send(ConsoleRequest { command, reply }).await.is_err() {
            break;
        }
        let Ok(response) = response.await else {
            break;
        };

        if let Err(e) = writer.write_all(response.as_bytes()).await {
            warn!(error = %e, "writing console response");
            break;
        }
    }

    let _ = writer.shutdown().await;
    debug!("console connection closed");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncReadExt;

    use super::*;

    /// Answers every request with the command name.
    fn spawn_echo_worker(mut rx: mpsc::Receiver<ConsoleRequest>) {
        tokio::spawn(async move {
            while let Some(req) = rx.recv().await {
                let _ = req.reply.send(format!("{}\n", req.command.name()));
            }
        });
    }

    async fn start() -> (std::net::SocketAddr, Arc<HealthMetrics>, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (tx, rx) = mpsc::channel(8);
        spawn_echo_worker(rx);

        let health = Arc::new(HealthMetrics::new(":0").expect("health"));
        let cancel = CancellationToken::new();
        tokio::spawn(serve(listener, tx, Arc::clone(&health), cancel.clone()));
        (addr, health, cancel)
    }

    #[tokio::test]
    async fn test_commands_are_forwarded_until_quit() {
        let (addr, health, cancel) = start().await;
        let mut conn = TcpStream::connect(addr).await.expect("connect");

        conn.write_all(b"stats\nnope\nquit\n").await.expect("write");

        let mut out = String::new();
        tokio::time::timeout(Duration::from_secs(5), conn.read_to_string(&mut out))
            .await
            .expect("timeout")
            .expect("read");

        assert_eq!(out, "stats\nunknown\n");
        assert_eq!(health.console_connections.get(), 1.0);
        assert_eq!(
            health.console_commands.with_label_values(&["quit"]).get(),
            1.0
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_connection_survives_unknown_commands() {
        let (addr, _health, cancel) = start().await;
        let conn = TcpStream::connect(addr).await.expect("connect");
        let (reader, mut writer) = conn.into_split();
        let mut lines = BufReader::new(reader).lines();

        for _ in 0..3 {
            writer.write_all(b"bogus\n").await.expect("write");
            let line = lines.next_line().await.expect("read").expect("line");
            assert_eq!(line, "unknown");
        }
        writer.write_all(b"help\n").await.expect("write");
        assert_eq!(lines.next_line().await.expect("read"), Some("help".to_string()));
        cancel.cancel();
    }
}
