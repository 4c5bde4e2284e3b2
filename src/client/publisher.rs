//! Publisher client: serializes events and sends them at a configured rate.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{BusResult, TransportError};
use crate::event::{now_ms, Event};
use crate::wire::frame::write_envelope;
use crate::wire::{Envelope, Payload};

/// Produces the events a publisher sends. Implementations range from
/// replaying fixtures in tests to the random workload generator.
pub trait EventSource: Send {
    /// The next event to publish.
    fn next_event(&mut self) -> Event;
}

/// A publisher connection to one broker's ingress endpoint.
///
/// Sends are fire-and-forget: a failed send drops the event, bumps
/// `send_errors`, and surfaces the error to the caller, but nothing is
/// retried.
pub struct Publisher {
    stream: TcpStream,
    events_sent: u64,
    send_errors: u64,
}

impl Publisher {
    /// Connects to a broker's publisher ingress.
    pub fn connect(addr: impl ToSocketAddrs + std::fmt::Debug) -> BusResult<Self> {
        let stream = TcpStream::connect(&addr).map_err(|e| TransportError::ConnectionFailed {
            endpoint: format!("{addr:?}"),
            message: e.to_string(),
        })?;
        stream.set_nodelay(true).map_err(TransportError::Io)?;
        Ok(Self {
            stream,
            events_sent: 0,
            send_errors: 0,
        })
    }

    /// Publishes one event, stamping its timestamp at send time.
    pub fn publish(&mut self, mut event: Event) -> BusResult<()> {
        event.timestamp = now_ms();
        let env = Envelope::new(Payload::Event(event));
        match write_envelope(&mut self.stream, &env) {
            Ok(()) => {
                self.events_sent += 1;
                Ok(())
            }
            Err(err) => {
                self.send_errors += 1;
                debug!(error = %err, "event send failed; dropped");
                Err(err)
            }
        }
    }

    /// Publishes `count` events from `source` at roughly `rate_per_sec`.
    /// Returns the number actually sent; failed sends are dropped and
    /// counted, not retried.
    pub fn run(&mut self, source: &mut dyn EventSource, rate_per_sec: f64, count: usize) -> u64 {
        let interval = if rate_per_sec > 0.0 {
            Duration::from_secs_f64(1.0 / rate_per_sec)
        } else {
            Duration::ZERO
        };

        let before = self.events_sent;
        for _ in 0..count {
            let started = Instant::now();
            let _ = self.publish(source.next_event());
            let elapsed = started.elapsed();
            if interval > elapsed {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.events_sent - before
    }

    /// Events successfully written so far.
    #[must_use]
    pub const fn events_sent(&self) -> u64 {
        self.events_sent
    }

    /// Failed (dropped) sends so far.
    #[must_use]
    pub const fn send_errors(&self) -> u64 {
        self.send_errors
    }
}
