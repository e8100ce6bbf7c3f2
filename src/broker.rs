//! The broker task: serializes device access across client connections.
//!
//! One task exclusively owns all broker state: the serial port, the command
//! scheduler, the response framer, the client registry and the response
//! deadline. Every readiness source (client connections, the serial reader)
//! is a long-lived task that dispatches into the broker over a single `mpsc`
//! channel, so there is no shared mutable state and no locking.
//!
//! ## Command life cycle
//!
//! A submitted command either claims the free active slot and is written to
//! the device immediately, or waits in the FIFO queue. While a command is in
//! flight a one-second response deadline is armed; reply bytes stream to the
//! submitter verbatim until the `\r\n#STOP\r\n` trailer is seen, at which
//! point the queue head (if any) is dispatched.
//!
//! ## Recovery
//!
//! A response timeout or port error synthesizes `#ERROR\r\n#STOP\r\n` to the
//! active connection and resets the device: the descriptor is closed, the
//! optional reset hook runs to completion, the device is reopened with its
//! cached line discipline. A failed reopen re-arms the deadline so the next
//! expiration retries recovery.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nix::sys::termios::Termios;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::protocol::{ResponseFramer, ERROR_ENVELOPE};
use crate::scheduler::{ClientId, Dispatch, PendingCommand, Scheduler};
use crate::serial::{run_reset_hook, SerialPort};

/// How long the device gets to finish a reply before the broker resets it.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

/// One kernel read's worth of reply bytes.
const SERIAL_READ_BUF: usize = 512;

/// Everything that can wake the broker.
#[derive(Debug)]
pub enum Event {
    /// A client connection was accepted; `reply` carries its outbound bytes.
    Connected {
        id: ClientId,
        reply: mpsc::UnboundedSender<Vec<u8>>,
    },
    /// A complete newline-terminated command arrived from a client.
    Command { id: ClientId, line: Vec<u8> },
    /// A client connection ended (EOF, error or protocol violation).
    Disconnected { id: ClientId },
    /// Bytes read from the serial device.
    SerialData { generation: u64, bytes: Vec<u8> },
    /// The serial reader hit a read error or EOF.
    SerialError { generation: u64, error: String },
}

pub struct Broker {
    /// Pathname of the serial device node, kept for reopening.
    device: PathBuf,
    /// Line discipline captured at open, re-applied verbatim on reset.
    settings: Mutex<Termios>,
    /// Optional executable invoked between close and reopen during reset.
    hook: Option<PathBuf>,
    /// The open port; `None` while a reset has failed and is pending retry.
    port: Option<Arc<SerialPort>>,
    /// Reader task feeding `SerialData`/`SerialError` events.
    reader: Option<JoinHandle<()>>,
    /// Bumped on every reset so events from a torn-down reader are ignored.
    generation: u64,
    /// Sender handed to serial reader tasks.
    events_tx: mpsc::Sender<Event>,
    /// Live connections, keyed by id. Removing an entry closes the socket.
    clients: HashMap<ClientId, mpsc::UnboundedSender<Vec<u8>>>,
    sched: Scheduler,
    framer: ResponseFramer,
    /// Armed iff the active slot is occupied (plus the failed-reset retry).
    deadline: Option<Instant>,
    /// Limits the unsolicited-output warning to one per burst.
    unsolicited_warned: bool,
}

impl Broker {
    /// Wrap an opened serial port and start its reader task. Must be called
    /// within a runtime.
    pub fn new(
        port: SerialPort,
        device: PathBuf,
        hook: Option<PathBuf>,
        events_tx: mpsc::Sender<Event>,
    ) -> Self {
        let settings = port.line_discipline();
        let port = Arc::new(port);
        let reader = spawn_serial_reader(Arc::clone(&port), 0, events_tx.clone());

        Self {
            device,
            settings: Mutex::new(settings),
            hook,
            port: Some(port),
            reader: Some(reader),
            generation: 0,
            events_tx,
            clients: HashMap::new(),
            sched: Scheduler::new(),
            framer: ResponseFramer::new(),
            deadline: None,
            unsolicited_warned: false,
        }
    }

    /// Drive the broker until the event channel closes.
    pub async fn run(mut self, mut events: mpsc::Receiver<Event>) {
        loop {
            let deadline = self.deadline;
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                () = response_timer(deadline) => self.handle_timeout().await,
            }
        }

        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Connected { id, reply } => {
                debug!("Client {id} connected");
                self.clients.insert(id, reply);
            }
            Event::Command { id, line } => self.handle_command(id, line).await,
            Event::Disconnected { id } => {
                debug!("Client {id} disconnected");
                // The active slot and queue entries keep the id; any reply
                // still owed to it is discarded when forwarding fails to
                // resolve the client.
                self.clients.remove(&id);
            }
            Event::SerialData { generation, bytes } if generation == self.generation => {
                self.handle_serial_data(bytes).await;
            }
            Event::SerialError { generation, error } if generation == self.generation => {
                warn!("Serial port error: {error}");
                if self.reset(true).await.is_ok() {
                    self.finish_active().await;
                }
            }
            // A reader torn down during reset may still have events queued.
            Event::SerialData { .. } | Event::SerialError { .. } => {}
        }
    }

    async fn handle_command(&mut self, id: ClientId, line: Vec<u8>) {
        match self.sched.submit(id, line) {
            Dispatch::Now(cmd) => self.pump(Some(cmd)).await,
            Dispatch::Queued => {}
            Dispatch::QueueFull => {
                warn!("Client {id}: pending command queue full, closing connection");
                self.clients.remove(&id);
            }
        }
    }

    async fn handle_serial_data(&mut self, bytes: Vec<u8>) {
        let Some(active) = self.sched.active() else {
            if !self.unsolicited_warned {
                warn!(
                    "Discarding unsolicited output from device ({} byte(s))",
                    bytes.len()
                );
                self.unsolicited_warned = true;
            }
            return;
        };

        let complete = self.framer.extend(&bytes);
        // A reply whose requester already disconnected is dropped here.
        self.send_to_client(active, bytes);
        if complete {
            self.finish_active().await;
        }
    }

    async fn handle_timeout(&mut self) {
        if self.sched.active().is_some() {
            warn!("Device response timeout, resetting");
        }
        if self.reset(true).await.is_ok() {
            self.finish_active().await;
        }
    }

    /// End the in-flight command and dispatch the queue head, if any.
    async fn finish_active(&mut self) {
        self.framer.clear();
        self.deadline = None;
        let next = self.sched.complete();
        self.pump(next).await;
    }

    /// Dispatch `next` to the device, draining further queued commands past
    /// any write failure (each failure resets the port and fails its
    /// submitter with an error envelope).
    async fn pump(&mut self, mut next: Option<PendingCommand>) {
        while let Some(cmd) = next {
            self.framer.clear();
            self.deadline = Some(Instant::now() + RESPONSE_TIMEOUT);
            self.unsolicited_warned = false;

            match self.write_serial(&cmd.line).await {
                Ok(()) => return,
                Err(e) => {
                    warn!("Serial write failed: {e}");
                    if self.reset(true).await.is_err() {
                        // Reopen failed; deadline is re-armed and the next
                        // expiration retries recovery.
                        return;
                    }
                    self.framer.clear();
                    self.deadline = None;
                    next = self.sched.complete();
                }
            }
        }
        self.deadline = None;
    }

    /// The reset procedure: fail the active command with an error envelope,
    /// release the descriptor, run the hook, reopen with the cached line
    /// discipline and restart the reader.
    async fn reset(&mut self, fail_active: bool) -> Result<(), String> {
        if fail_active {
            if let Some(id) = self.sched.active() {
                self.send_to_client(id, ERROR_ENVELOPE.to_vec());
            }
        }

        // Tear down the reader and close the descriptor before the hook
        // power-cycles the device.
        if let Some(reader) = self.reader.take() {
            reader.abort();
            let _ = reader.await;
        }
        self.port = None;
        self.generation += 1;

        if let Some(hook) = self.hook.clone() {
            run_reset_hook(&hook).await;
        }

        match SerialPort::reopen(
            &self.device,
            &self.settings.lock().expect("settings mutex poisoned"),
        ) {
            Ok(port) => {
                let port = Arc::new(port);
                self.reader = Some(spawn_serial_reader(
                    Arc::clone(&port),
                    self.generation,
                    self.events_tx.clone(),
                ));
                self.port = Some(port);
                info!("Serial device {} reopened", self.device.display());
                Ok(())
            }
            Err(e) => {
                error!("Failed to reopen serial device: {e}");
                self.deadline = Some(Instant::now() + RESPONSE_TIMEOUT);
                Err(e)
            }
        }
    }

    async fn write_serial(&self, line: &[u8]) -> io::Result<()> {
        match &self.port {
            Some(port) => port.write_all(line).await,
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "serial port closed",
            )),
        }
    }

    fn send_to_client(&mut self, id: ClientId, bytes: Vec<u8>) {
        if let Some(tx) = self.clients.get(&id) {
            if tx.send(bytes).is_err() {
                // Connection task is gone; its Disconnected event is in
                // flight or already consumed.
                self.clients.remove(&id);
            }
        }
    }
}

async fn response_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Long-lived reader feeding device bytes into the broker's event channel.
fn spawn_serial_reader(
    port: Arc<SerialPort>,
    generation: u64,
    tx: mpsc::Sender<Event>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; SERIAL_READ_BUF];
        loop {
            match port.read(&mut buf).await {
                Ok(0) => {
                    let _ = tx
                        .send(Event::SerialError {
                            generation,
                            error: "device closed".to_string(),
                        })
                        .await;
                    break;
                }
                Ok(n) => {
                    let bytes = buf[..n].to_vec();
                    if tx.send(Event::SerialData { generation, bytes }).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx
                        .send(Event::SerialError {
                            generation,
                            error: e.to_string(),
                        })
                        .await;
                    break;
                }
            }
        }
    })
}
