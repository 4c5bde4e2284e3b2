//! Peer overlay links.
//!
//! Each configured peer endpoint gets one outbound link thread that dials
//! with capped exponential backoff, learns the remote broker id from the
//! identification hello the acceptor writes, announces the local
//! subscription summaries, and then drains the peer's outbound queue onto
//! the socket. Inbound traffic arrives on the peer listener (see the broker
//! module); the two directions together form the full-duplex link.

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::subscription::Subscription;
use crate::wire::frame::{read_envelope_or_stop, write_envelope};
use crate::wire::{Envelope, Payload};

use super::core::{ControlMsg, LinkTransition};

/// Peer link lifecycle. Connect success, heartbeat timeouts, and shutdown
/// drive the transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No connection; the link thread will redial.
    Disconnected,
    /// Dial in progress.
    Connecting,
    /// Connected and heartbeating.
    Up,
    /// Heartbeats missed; summaries retained, notifications dropped.
    Down,
    /// Shut down for good.
    Closed,
}

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Runs one outbound peer link until shutdown.
pub(crate) fn run_outbound_link(
    index: usize,
    endpoint: String,
    control_tx: Sender<ControlMsg>,
    out_rx: Receiver<Envelope>,
    shutdown: Arc<AtomicBool>,
) {
    let mut backoff = INITIAL_BACKOFF;
    while !shutdown.load(Ordering::Relaxed) {
        if control_tx
            .send(ControlMsg::PeerLink {
                index,
                transition: LinkTransition::Connecting,
            })
            .is_err()
        {
            break;
        }

        let stream = match TcpStream::connect(endpoint.as_str()) {
            Ok(stream) => stream,
            Err(err) => {
                debug!(endpoint = %endpoint, error = %err, "peer dial failed");
                let _ = control_tx.send(ControlMsg::PeerLink {
                    index,
                    transition: LinkTransition::Lost,
                });
                sleep_interruptible(backoff, &shutdown);
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };

        match serve_connection(index, &endpoint, stream, &control_tx, &out_rx, &shutdown) {
            Ok(()) => break, // orderly exit
            Err(()) => {
                let _ = control_tx.send(ControlMsg::PeerLink {
                    index,
                    transition: LinkTransition::Lost,
                });
                sleep_interruptible(backoff, &shutdown);
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
    debug!(endpoint = %endpoint, "peer link thread stopped");
}

/// Drives one established connection. `Ok` means orderly shutdown; `Err`
/// asks the caller to back off and redial.
fn serve_connection(
    index: usize,
    endpoint: &str,
    mut stream: TcpStream,
    control_tx: &Sender<ControlMsg>,
    out_rx: &Receiver<Envelope>,
    shutdown: &Arc<AtomicBool>,
) -> Result<(), ()> {
    if stream
        .set_read_timeout(Some(Duration::from_millis(500)))
        .is_err()
        || stream.set_nodelay(true).is_err()
    {
        return Err(());
    }

    // The acceptor writes one identification hello; it carries the remote
    // broker id that notifications are routed by.
    let remote_id = match read_envelope_or_stop(&mut stream, shutdown) {
        Ok(Some(Envelope {
            payload: Payload::Heartbeat(hb),
            ..
        })) => hb.broker_id,
        Ok(Some(_)) | Err(_) => {
            warn!(endpoint = %endpoint, "peer sent no identification hello");
            return Err(());
        }
        Ok(None) => return Ok(()),
    };

    let (reply_tx, reply_rx) = bounded::<Vec<Subscription>>(1);
    if control_tx
        .send(ControlMsg::PeerLink {
            index,
            transition: LinkTransition::Connected {
                remote_id: remote_id.clone(),
                reply: reply_tx,
            },
        })
        .is_err()
    {
        return Ok(());
    }
    let Ok(summaries) = reply_rx.recv_timeout(Duration::from_secs(5)) else {
        return Err(());
    };

    info!(endpoint = %endpoint, remote_id = %remote_id, summaries = summaries.len(), "peer link up");
    for sub in summaries {
        let env = Envelope::new(Payload::Subscribe(sub));
        if write_envelope(&mut stream, &env).is_err() {
            return Err(());
        }
    }

    loop {
        if shutdown.load(Ordering::Relaxed) {
            // Flush whatever is queued (the final SHUTDOWN heartbeat in
            // particular), then leave.
            while let Ok(env) = out_rx.try_recv() {
                if write_envelope(&mut stream, &env).is_err() {
                    break;
                }
            }
            return Ok(());
        }
        match out_rx.recv_timeout(Duration::from_millis(250)) {
            Ok(env) => {
                if let Err(err) = write_envelope(&mut stream, &env) {
                    warn!(endpoint = %endpoint, error = %err, "peer write failed");
                    return Err(());
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        }
    }
}

fn sleep_interruptible(total: Duration, shutdown: &Arc<AtomicBool>) {
    let step = Duration::from_millis(50);
    let mut slept = Duration::ZERO;
    while slept < total && !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(step);
        slept += step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = INITIAL_BACKOFF;
        let mut seen = Vec::new();
        for _ in 0..10 {
            seen.push(backoff);
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        assert_eq!(seen[0], Duration::from_millis(500));
        assert_eq!(seen[1], Duration::from_secs(1));
        assert!(seen.iter().all(|b| *b <= MAX_BACKOFF));
        assert_eq!(*seen.last().unwrap(), MAX_BACKOFF);
    }
}
