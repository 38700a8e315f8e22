//! # Client Facade
//!
//! Purpose: Expose the HandlerSocket operations over a pair of connections,
//! routing lookups to the read port and mutations to the write port.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `HandlerSocket` hides connections, correlation and
//!    the index registry behind six calls.
//! 2. **Validate Before I/O**: Unknown index ids and oversized value lists are
//!    rejected without touching a socket.
//! 3. **Shared by Reference**: Every method takes `&self`; wrap the client in
//!    an `Arc` to call it from many tasks.
//! 4. **No Hidden Retries**: A failed call is reported, never replayed. The
//!    only reconnect is the rebuild of a connection whose response stream was
//!    abandoned, done by the next ticket holder before it sends anything.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use hs_common::{decode_modified_count, Command, IndexId, ModifyOp, Operator, Response};

use crate::config::ClientConfig;
use crate::connection::{Connection, Direction, Lifecycle};
use crate::correlator::Ticket;
use crate::error::{ClientError, ClientResult};
use crate::registry::{materialize, IndexBinding, IndexRegistry, Row};

/// Endpoint pair the client was last asked to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    host: String,
    read_port: u16,
    write_port: u16,
}

impl Target {
    fn port(&self, direction: Direction) -> u16 {
        match direction {
            Direction::Read => self.read_port,
            Direction::Write => self.write_port,
        }
    }
}

enum Phase {
    Disconnected,
    Connecting,
    Connected {
        read: Arc<Connection>,
        write: Arc<Connection>,
    },
    Closed,
}

struct State {
    phase: Phase,
    target: Option<Target>,
}

/// HandlerSocket client over one read and one write connection.
///
/// Index bindings live in this instance only; a fresh `connect` starts with
/// none.
pub struct HandlerSocket {
    config: ClientConfig,
    state: Mutex<State>,
    registry: IndexRegistry,
}

impl Default for HandlerSocket {
    fn default() -> Self {
        HandlerSocket::new()
    }
}

impl HandlerSocket {
    /// Creates an unconnected client with default configuration.
    pub fn new() -> Self {
        HandlerSocket::with_config(ClientConfig::default())
    }

    /// Creates an unconnected client with a custom configuration.
    pub fn with_config(config: ClientConfig) -> Self {
        HandlerSocket {
            config,
            state: Mutex::new(State {
                phase: Phase::Disconnected,
                target: None,
            }),
            registry: IndexRegistry::default(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connects to `host` on the configured read and write ports.
    pub async fn connect(&self, host: &str) -> ClientResult<()> {
        self.connect_to(host, self.config.read_port, self.config.write_port)
            .await
    }

    /// Dials both connections concurrently and starts their tasks.
    pub async fn connect_to(&self, host: &str, read_port: u16, write_port: u16) -> ClientResult<()> {
        if host.trim().is_empty() {
            return Err(ClientError::Usage("host must not be empty".to_string()));
        }
        let target = Target {
            host: host.to_string(),
            read_port,
            write_port,
        };

        {
            let mut state = self.state.lock();
            if matches!(state.phase, Phase::Connecting | Phase::Connected { .. }) {
                return Err(ClientError::AlreadyConnected);
            }
            state.phase = Phase::Connecting;
            state.target = Some(target.clone());
        }
        let guard = ConnectingGuard {
            state: &self.state,
            armed: true,
        };
        self.registry.clear();

        let dialed = tokio::try_join!(
            Connection::open(Direction::Read, host, read_port, &self.config),
            Connection::open(Direction::Write, host, write_port, &self.config),
        );
        let (read, write) = dialed?;

        guard.disarm();
        self.state.lock().phase = Phase::Connected {
            read: Arc::new(read),
            write: Arc::new(write),
        };
        info!(host, read_port, write_port, "connected");
        Ok(())
    }

    /// Closes both connections and stops their tasks.
    pub fn close(&self) -> ClientResult<()> {
        let (read, write) = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut state.phase, Phase::Closed) {
                Phase::Connected { read, write } => (read, write),
                other => {
                    state.phase = other;
                    return Err(ClientError::NotConnected);
                }
            }
        };
        read.close();
        write.close();
        info!("closed");
        Ok(())
    }

    /// Force-closes and connects again to the last target.
    ///
    /// Bindings do not survive; indexes must be opened again.
    pub async fn reconnect(&self) -> ClientResult<()> {
        let target = self
            .state
            .lock()
            .target
            .clone()
            .ok_or_else(|| ClientError::Usage("reconnect called before connect".to_string()))?;
        if let Err(err) = self.close() {
            debug!(error = %err, "ignoring close failure during reconnect");
        }
        self.connect_to(&target.host, target.read_port, target.write_port)
            .await
    }

    /// Lifecycle of one connection, or of the client before it has any.
    pub fn lifecycle(&self, direction: Direction) -> Lifecycle {
        match &self.state.lock().phase {
            Phase::Disconnected => Lifecycle::Disconnected,
            Phase::Connecting => Lifecycle::Connecting,
            Phase::Connected { read, write } => match direction {
                Direction::Read => read.lifecycle(),
                Direction::Write => write.lifecycle(),
            },
            Phase::Closed => Lifecycle::Closed,
        }
    }

    /// Current binding for `index_id`, if one is installed.
    pub fn binding(&self, index_id: IndexId) -> Option<Arc<IndexBinding>> {
        self.registry.get(index_id)
    }

    /// Declares an index on both connections and binds its columns.
    ///
    /// Both sides are attempted even if one fails; the error names each side
    /// that did. A side that succeeded is not rolled back.
    pub async fn open_index(
        &self,
        index_id: IndexId,
        database: &str,
        table: &str,
        index_name: &str,
        columns: &[&str],
    ) -> ClientResult<()> {
        self.ensure_connected()?;
        if database.is_empty() || table.is_empty() || index_name.is_empty() {
            return Err(ClientError::Usage(
                "database, table and index name are required".to_string(),
            ));
        }
        if columns.is_empty() || columns.iter().any(|c| c.is_empty()) {
            return Err(ClientError::Usage(
                "open_index needs at least one non-empty column".to_string(),
            ));
        }

        let binding = IndexBinding {
            index_id,
            database: database.to_string(),
            table: table.to_string(),
            index_name: index_name.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        };
        let command = binding.open_command();

        let deadline = self.deadline();
        let read = self.settled(Direction::Read, deadline).await?;
        let write = self.settled(Direction::Write, deadline).await?;

        // Fixed order: read before write. Single-connection calls take one
        // ticket only, so this cannot deadlock.
        let mut read_ticket = read.correlator().acquire(deadline).await;
        let mut write_ticket = write.correlator().acquire(deadline).await;
        let (read_result, write_result) = tokio::join!(
            submit(&mut read_ticket, command.clone(), deadline),
            submit(&mut write_ticket, command, deadline),
        );

        let read_failure = read_result.and_then(expect_ok).err();
        let write_failure = write_result.and_then(expect_ok).err();
        if read_failure.is_none() && write_failure.is_none() {
            // Installed while both tickets are held, so no lookup can observe
            // the server-side index before its columns are bound.
            self.registry.install(binding);
            debug!(index_id, database, table, index_name, "index opened");
            return Ok(());
        }

        warn!(index_id, ?read_failure, ?write_failure, "open_index failed");
        Err(ClientError::IndexOpen {
            index_id,
            read: read_failure.map(Box::new),
            write: write_failure.map(Box::new),
        })
    }

    /// Looks up rows on the read connection.
    ///
    /// `values` may be a prefix of the index columns; `op` decides how they
    /// compare.
    pub async fn find(
        &self,
        index_id: IndexId,
        op: Operator,
        limit: u32,
        offset: u32,
        values: &[&str],
    ) -> ClientResult<Vec<Row>> {
        self.ensure_connected()?;
        let binding = self.bound(index_id)?;
        check_values("find", &binding, values)?;

        let command = Command::Find {
            index_id,
            op,
            values: to_strings(values),
            limit,
            offset,
        };
        self.exchange(Direction::Read, command, |response| {
            if !response.is_ok() {
                return Err(ClientError::Server {
                    message: response.message(),
                    status: response.status,
                });
            }
            // Re-read under the ticket: an open_index that replaced the
            // binding has finished on this connection by now.
            let binding = self.bound(index_id)?;
            materialize(&binding, &response.fields)
        })
        .await
    }

    /// Inserts one row on the write connection.
    pub async fn insert(&self, index_id: IndexId, values: &[&str]) -> ClientResult<()> {
        self.ensure_connected()?;
        let binding = self.bound(index_id)?;
        check_values("insert", &binding, values)?;

        let command = Command::Insert {
            index_id,
            values: to_strings(values),
        };
        self.exchange(Direction::Write, command, |response| {
            match response.status.as_str() {
                "0" => Ok(()),
                "1" => Err(ClientError::DuplicateKey { index_id }),
                _ => Err(ClientError::Insert {
                    index_id,
                    message: response.message(),
                    status: response.status,
                }),
            }
        })
        .await
    }

    /// Updates or deletes matching rows on the write connection.
    ///
    /// Returns the number of rows the server reports as affected.
    #[allow(clippy::too_many_arguments)]
    pub async fn modify(
        &self,
        index_id: IndexId,
        op: Operator,
        limit: u32,
        offset: u32,
        modify_op: ModifyOp,
        keys: &[&str],
        new_values: &[&str],
    ) -> ClientResult<u64> {
        self.ensure_connected()?;
        let binding = self.bound(index_id)?;
        check_values("modify", &binding, keys)?;
        if modify_op == ModifyOp::Update {
            if new_values.is_empty() {
                return Err(ClientError::Usage(
                    "update needs at least one new value".to_string(),
                ));
            }
            if new_values.len() > binding.columns.len() {
                return Err(ClientError::Usage(format!(
                    "update has {} new values but index {index_id} binds {} columns",
                    new_values.len(),
                    binding.columns.len()
                )));
            }
        }

        let command = Command::Modify {
            index_id,
            op,
            values: to_strings(keys),
            limit,
            offset,
            modify_op,
            new_values: match modify_op {
                ModifyOp::Update => to_strings(new_values),
                ModifyOp::Delete => Vec::new(),
            },
        };
        self.exchange(Direction::Write, command, |response| {
            if !response.is_ok() {
                return Err(ClientError::Modify {
                    index_id,
                    message: response.message(),
                    status: response.status,
                });
            }
            Ok(decode_modified_count(&response.fields)?)
        })
        .await
    }

    /// One request on one connection; `finish` runs while the ticket is held.
    ///
    /// Abandonment is checked under the ticket: a request that is merely in
    /// flight on another task makes this call wait, not rebuild.
    async fn exchange<T>(
        &self,
        direction: Direction,
        command: Command,
        finish: impl FnOnce(Response) -> ClientResult<T>,
    ) -> ClientResult<T> {
        let mut connection = self.current(direction)?;
        let mut deadline = self.deadline();
        let mut rebuilt = false;
        loop {
            {
                let mut ticket = connection.correlator().acquire(deadline).await?;
                if !ticket.is_abandoned() {
                    let response = ticket.round_trip(command, deadline).await?;
                    return finish(response);
                }
            }
            if rebuilt {
                return Err(ClientError::connection(
                    direction,
                    "rebuilt connection was abandoned before use",
                ));
            }
            connection = self.rebuild(direction, connection).await?;
            // Time spent queued behind the abandoned request does not count.
            deadline = self.deadline();
            rebuilt = true;
        }
    }

    fn ensure_connected(&self) -> ClientResult<()> {
        match self.state.lock().phase {
            Phase::Connected { .. } => Ok(()),
            _ => Err(ClientError::NotConnected),
        }
    }

    fn bound(&self, index_id: IndexId) -> ClientResult<Arc<IndexBinding>> {
        self.registry
            .get(index_id)
            .ok_or(ClientError::UnregisteredIndex(index_id))
    }

    fn deadline(&self) -> Option<Instant> {
        self.config
            .request_timeout()
            .map(|timeout| Instant::now() + timeout)
    }

    fn current(&self, direction: Direction) -> ClientResult<Arc<Connection>> {
        match &self.state.lock().phase {
            Phase::Connected { read, write } => Ok(match direction {
                Direction::Read => read.clone(),
                Direction::Write => write.clone(),
            }),
            _ => Err(ClientError::NotConnected),
        }
    }

    /// Connection for `direction`, rebuilt first if the last ticket holder
    /// abandoned it.
    async fn settled(&self, direction: Direction, deadline: Option<Instant>) -> ClientResult<Arc<Connection>> {
        let connection = self.current(direction)?;
        let abandoned = connection.correlator().acquire(deadline).await?.is_abandoned();
        if abandoned {
            self.rebuild(direction, connection).await
        } else {
            Ok(connection)
        }
    }

    /// Replaces `stale` with a freshly dialed connection and reopens every
    /// bound index on it. Returns the current connection untouched if another
    /// caller already replaced `stale`.
    async fn rebuild(&self, direction: Direction, stale: Arc<Connection>) -> ClientResult<Arc<Connection>> {
        let target = {
            let state = self.state.lock();
            let Phase::Connected { read, write } = &state.phase else {
                return Err(ClientError::NotConnected);
            };
            let current = match direction {
                Direction::Read => read,
                Direction::Write => write,
            };
            if !Arc::ptr_eq(current, &stale) {
                return Ok(current.clone());
            }
            let target = state.target.clone();
            target.ok_or(ClientError::NotConnected)?
        };

        warn!(%direction, addr = stale.addr(), "rebuilding abandoned connection");
        stale.close();
        let fresh = Connection::open(direction, &target.host, target.port(direction), &self.config).await?;
        self.replay_bindings(&fresh).await;
        let fresh = Arc::new(fresh);

        let mut state = self.state.lock();
        let Phase::Connected { read, write } = &mut state.phase else {
            fresh.close();
            return Err(ClientError::NotConnected);
        };
        let slot = match direction {
            Direction::Read => read,
            Direction::Write => write,
        };
        if Arc::ptr_eq(slot, &stale) {
            *slot = fresh.clone();
            Ok(fresh)
        } else {
            // Another caller rebuilt it while this one was dialing.
            fresh.close();
            Ok(slot.clone())
        }
    }

    async fn replay_bindings(&self, connection: &Connection) {
        for binding in self.registry.snapshot() {
            let deadline = self.deadline();
            let outcome = async {
                let mut ticket = connection.correlator().acquire(deadline).await?;
                let response = ticket.round_trip(binding.open_command(), deadline).await?;
                expect_ok(response)
            }
            .await;
            if let Err(err) = outcome {
                warn!(
                    direction = %connection.direction(),
                    index_id = binding.index_id,
                    error = %err,
                    "failed to reopen index on rebuilt connection"
                );
            }
        }
    }
}

/// Resets a `Connecting` phase if `connect_to` fails or is cancelled.
struct ConnectingGuard<'a> {
    state: &'a Mutex<State>,
    armed: bool,
}

impl ConnectingGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.state.lock();
            if matches!(state.phase, Phase::Connecting) {
                state.phase = Phase::Disconnected;
            }
        }
    }
}

async fn submit(
    ticket: &mut ClientResult<Ticket<'_>>,
    command: Command,
    deadline: Option<Instant>,
) -> ClientResult<Response> {
    match ticket {
        Ok(ticket) => ticket.round_trip(command, deadline).await,
        Err(err) => Err(err.clone()),
    }
}

fn expect_ok(response: Response) -> ClientResult<()> {
    if response.is_ok() {
        Ok(())
    } else {
        Err(ClientError::Server {
            message: response.message(),
            status: response.status,
        })
    }
}

fn check_values(operation: &str, binding: &IndexBinding, values: &[&str]) -> ClientResult<()> {
    if values.is_empty() {
        return Err(ClientError::Usage(format!(
            "{operation} needs at least one value"
        )));
    }
    if values.len() > binding.columns.len() {
        return Err(ClientError::Usage(format!(
            "{operation} has {} values but index {} binds {} columns",
            values.len(),
            binding.index_id,
            binding.columns.len()
        )));
    }
    Ok(())
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}
