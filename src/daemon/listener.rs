use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::export::health::HealthMetrics;

/// Largest payload a single UDP datagram can carry.
const MAX_DATAGRAM: usize = 65_535;

/// Receives datagrams and queues them for the worker.
///
/// The queue is bounded; when the worker falls behind this loop waits,
/// and the kernel drops whatever overflows the socket buffer.
pub async fn run_udp(
    socket: UdpSocket,
    packets: mpsc::Sender<Vec<u8>>,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };

        match received {
            Ok((len, _peer)) => {
                if packets.send(buf[..len].to_vec()).await.is_err() {
                    // Worker has exited.
                    break;
                }
            }
            Err(e) => {
                health.udp_receive_errors.inc();
                warn!(error = %e, "receiving datagram");
            }
        }
    }
}
