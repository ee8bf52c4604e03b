//! Per-connection record routing.
//!
//! A [`Connection`] owns one accepted socket and runs two threads:
//!
//! ```text
//!              ┌────────────┐  route by id   ┌───────────────┐
//!  socket ───► │   reader   │ ─────────────► │ request table │ (Mutex)
//!              └────────────┘                └───────────────┘
//!                    │ dispatch                       ▲ remove on completion
//!                    ▼                                │
//!           handler (inline, or on the request pool) ─┘
//!                    │ Outbound::Burst
//!                    ▼
//!              ┌────────────┐
//!  socket ◄─── │   writer   │  single owner of the write half
//!              └────────────┘
//! ```
//!
//! Every record leaves through the writer thread, and each event's records
//! travel as one burst, so bytes of different requests never interleave
//! inside a record. Without multiplexing the handler runs on the reader
//! thread and requests are served strictly one at a time.
use std::{
    collections::HashMap,
    io::BufWriter,
    sync::{Arc, Mutex, MutexGuard, PoisonError, mpsc},
    thread,
};

use log::{debug, info, trace, warn};

use crate::{
    config::ServerConfig,
    handler::{self, Handler, Request},
};

use super::{
    ConnectionError, MANAGEMENT_ID, ProtocolError, Record, RecordType,
    request::{AbortOutcome, BeginRequest, PendingRequest, Progress, ProtocolStatus},
    response,
    thread::ThreadPool,
    transport::{RecordTransport, Transport},
};

/// Open requests of one connection.
#[derive(Debug, Default)]
struct RequestTable {
    open: HashMap<u16, PendingRequest>,
    close_when_idle: bool,
}

impl RequestTable {
    /// Records that a request left the table. Returns true once a request
    /// without keep-connection has finished and nothing else is open.
    fn release(&mut self, keep_connection: bool) -> bool {
        self.close_when_idle |= !keep_connection;
        self.close_when_idle && self.open.is_empty()
    }
}

/// Messages for a connection's writer thread.
#[derive(Debug)]
pub(crate) enum Outbound {
    /// Records written back to back; `close` shuts the socket afterwards.
    Burst { records: Vec<Record>, close: bool },
    Shutdown,
}

pub struct Connection {
    id: u64,
    transport: Transport,
    config: Arc<ServerConfig>,
    handler: Arc<dyn Handler>,
    workers: Arc<ThreadPool>,
    table: Arc<Mutex<RequestTable>>,
}

impl Connection {
    pub fn new(
        id: u64,
        transport: Transport,
        config: Arc<ServerConfig>,
        handler: Arc<dyn Handler>,
        workers: Arc<ThreadPool>,
    ) -> Self {
        Self {
            id,
            transport,
            config,
            handler,
            workers,
            table: Arc::default(),
        }
    }

    /// Serves the connection until the peer closes it, a request without
    /// keep-connection completes, or a fatal error occurs. Open requests
    /// are cancelled on the way out.
    pub fn serve(self) -> Result<(), ConnectionError> {
        info!("connection {} opened ({})", self.id, self.transport.peer());

        let (tx, rx) = mpsc::channel();
        let writer_stream = self.transport.try_clone()?;
        let id = self.id;
        let writer = thread::Builder::new()
            .name(format!("fcgid-conn-{id}-writer"))
            .spawn(move || write_loop(id, writer_stream, rx))?;

        let result = self
            .transport
            .try_clone()
            .map_err(ConnectionError::from)
            .and_then(|stream| self.read_loop(RecordTransport::new(stream), &tx));

        self.cancel_all();
        let _ = tx.send(Outbound::Shutdown);
        drop(tx);
        match writer.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("connection {}: writer failed: {e}", self.id),
            Err(_) => warn!("connection {}: writer panicked", self.id),
        }
        let _ = self.transport.shutdown();

        match &result {
            Ok(()) => info!("connection {} closed", self.id),
            Err(e) => warn!("connection {} closed: {e}", self.id),
        }
        result
    }

    fn read_loop(
        &self,
        mut reader: RecordTransport<Transport>,
        tx: &mpsc::Sender<Outbound>,
    ) -> Result<(), ConnectionError> {
        while let Some(record) = reader.read_record()? {
            self.route(record, tx)?;
        }
        Ok(())
    }

    fn route(&self, record: Record, tx: &mpsc::Sender<Outbound>) -> Result<(), ConnectionError> {
        if record.request_id == MANAGEMENT_ID {
            return self.manage(record, tx);
        }

        let id = record.request_id;
        match record.kind {
            RecordType::BeginRequest => self.begin(id, &record.content, tx),
            RecordType::AbortRequest => self.abort(id, tx),
            RecordType::Params | RecordType::Stdin => self.input(record, tx),
            RecordType::Data => {
                trace!("connection {}: ignoring data for request {id}", self.id);
                Ok(())
            }
            RecordType::Unknown(_) => {
                if self.lock().open.contains_key(&id) {
                    self.send(tx, response::unknown_type(record.kind)?, false);
                }
                Ok(())
            }
            RecordType::EndRequest
            | RecordType::Stdout
            | RecordType::Stderr
            | RecordType::GetValues
            | RecordType::GetValuesResult
            | RecordType::UnknownType => {
                warn!(
                    "connection {}: unexpected {} record for request {id}",
                    self.id, record.kind
                );
                Ok(())
            }
        }
    }

    fn manage(&self, record: Record, tx: &mpsc::Sender<Outbound>) -> Result<(), ConnectionError> {
        let records = match record.kind {
            RecordType::GetValues => response::get_values(&record.content, &self.config)?,
            kind => {
                debug!("connection {}: unknown management record {kind}", self.id);
                response::unknown_type(kind)?
            }
        };
        self.send(tx, records, false);
        Ok(())
    }

    fn begin(
        &self,
        id: u16,
        content: &[u8],
        tx: &mpsc::Sender<Outbound>,
    ) -> Result<(), ConnectionError> {
        let begin = BeginRequest::decode(content)?;
        let mut table = self.lock();

        if table.open.contains_key(&id) {
            return Err(ProtocolError::DuplicateRequestId(id).into());
        }

        if table.open.len() >= self.config.requests_per_connection() {
            let status = if self.config.multiplex {
                ProtocolStatus::Overloaded
            } else {
                ProtocolStatus::CantMpxConn
            };
            debug!("connection {}: rejecting request {id} with {status:?}", self.id);
            self.send(tx, response::end_request(id, 0, status)?, false);
            return Ok(());
        }

        let mut request = PendingRequest::new(id, begin);
        if let Err(answer) = request.accept() {
            debug!(
                "connection {}: request {id} asked for unsupported role {:?}",
                self.id,
                request.role()
            );
            let close = table.release(begin.keep_connection);
            self.send(tx, vec![answer.record(id)?], close);
            return Ok(());
        }

        debug!(
            "connection {}: request {id} opened (keep connection: {})",
            self.id, begin.keep_connection
        );
        table.open.insert(id, request);
        Ok(())
    }

    fn input(&self, record: Record, tx: &mpsc::Sender<Outbound>) -> Result<(), ConnectionError> {
        let progress = {
            let mut table = self.lock();
            let Some(request) = table.open.get_mut(&record.request_id) else {
                trace!(
                    "connection {}: ignoring {} for request {} that is not open",
                    self.id, record.kind, record.request_id
                );
                return Ok(());
            };
            request.on_input(record.kind, &record.content)?
        };

        if let Progress::Ready(request) = progress {
            self.dispatch(request, tx)?;
        }
        Ok(())
    }

    fn dispatch(&self, request: Request, tx: &mpsc::Sender<Outbound>) -> Result<(), ConnectionError> {
        let id = request.id();
        let job = Dispatch {
            connection: self.id,
            table: Arc::clone(&self.table),
            handler: Arc::clone(&self.handler),
            tx: tx.clone(),
            failure_status: self.config.failure_status,
            aborted_status: self.config.aborted_status,
        };

        if !self.config.multiplex {
            job.run(request);
            return Ok(());
        }

        if let Err(e) = self.workers.execute(move || job.run(request)) {
            warn!("connection {}: request {id} not dispatched: {e}", self.id);
            let records =
                response::end_request(id, self.config.failure_status, ProtocolStatus::Overloaded)?;
            let mut table = self.lock();
            let keep_connection = table
                .open
                .remove(&id)
                .is_none_or(|request| request.keep_connection());
            let close = table.release(keep_connection);
            self.send(tx, records, close);
        }
        Ok(())
    }

    fn abort(&self, id: u16, tx: &mpsc::Sender<Outbound>) -> Result<(), ConnectionError> {
        let mut table = self.lock();
        let Some(request) = table.open.get_mut(&id) else {
            trace!("connection {}: abort for request {id} that is not open", self.id);
            return Ok(());
        };

        match request.abort() {
            AbortOutcome::Immediate => {
                let keep_connection = table
                    .open
                    .remove(&id)
                    .is_none_or(|request| request.keep_connection());
                let close = table.release(keep_connection);
                debug!("connection {}: request {id} aborted", self.id);
                self.send(
                    tx,
                    response::end_request(
                        id,
                        self.config.aborted_status,
                        ProtocolStatus::RequestComplete,
                    )?,
                    close,
                );
            }
            AbortOutcome::Deferred => {
                debug!(
                    "connection {}: request {id} aborted while its handler runs",
                    self.id
                );
            }
            AbortOutcome::Ignored => {
                trace!("connection {}: request {id} already responding", self.id);
            }
        }
        Ok(())
    }

    fn cancel_all(&self) {
        for (id, mut request) in self.lock().open.drain() {
            request.cancel();
            debug!("connection {}: request {id} cancelled", self.id);
        }
    }

    fn send(&self, tx: &mpsc::Sender<Outbound>, records: Vec<Record>, close: bool) {
        if tx.send(Outbound::Burst { records, close }).is_err() {
            debug!("connection {}: writer is gone, dropping output", self.id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, RequestTable> {
        lock_table(&self.table)
    }
}

fn lock_table(table: &Mutex<RequestTable>) -> MutexGuard<'_, RequestTable> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One dispatched request on its way through the handler.
struct Dispatch {
    connection: u64,
    table: Arc<Mutex<RequestTable>>,
    handler: Arc<dyn Handler>,
    tx: mpsc::Sender<Outbound>,
    failure_status: u32,
    aborted_status: u32,
}

impl Dispatch {
    fn run(self, request: Request) {
        let id = request.id();
        debug!("connection {}: dispatching request {id}", self.connection);
        let outcome = handler::invoke(self.handler.as_ref(), &request);

        // The id is freed before its EndRequest is queued, so a peer that
        // reuses it right after reading the EndRequest is never refused.
        let mut table = lock_table(&self.table);
        let Some(mut pending) = table.open.remove(&id) else {
            debug!(
                "connection {}: request {id} was cancelled, dropping output",
                self.connection
            );
            return;
        };

        let records = if pending.start_responding() {
            response::respond(id, outcome, self.failure_status)
        } else {
            debug!(
                "connection {}: request {id} was aborted, dropping output",
                self.connection
            );
            response::end_request(id, self.aborted_status, ProtocolStatus::RequestComplete)
        };
        pending.complete();
        let close = table.release(pending.keep_connection());

        match records {
            Ok(records) => {
                if self.tx.send(Outbound::Burst { records, close }).is_err() {
                    debug!("connection {}: writer is gone", self.connection);
                }
            }
            Err(e) => warn!(
                "connection {}: failed to frame response of request {id}: {e}",
                self.connection
            ),
        }
    }
}

fn write_loop(
    connection: u64,
    stream: Transport,
    rx: mpsc::Receiver<Outbound>,
) -> Result<(), ConnectionError> {
    let mut writer = RecordTransport::new(BufWriter::new(stream));

    for message in rx {
        match message {
            Outbound::Burst { records, close } => {
                if let Err(e) = writer.write_records(&records) {
                    let _ = writer.get_ref().get_ref().shutdown();
                    return Err(e);
                }
                if close {
                    debug!("connection {connection}: last request done, closing");
                    writer.get_ref().get_ref().shutdown()?;
                    return Ok(());
                }
            }
            Outbound::Shutdown => break,
        }
    }
    Ok(())
}
