use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::connection::connection_config::ConnectionConfig;
use crate::connection::connection_state::StateCell;
use crate::protocol::encoder::encode;
use crate::protocol::operation::Operation;
use crate::transport::transport::TransportWriter;

pub(crate) enum WriterCommand {
    Op(Operation),
    /// Writes a PING, notifying `waiter` (if any) when the server's PONG arrives. The round trip
    ///  time is measured from `timed_from` if set.
    Ping {
        waiter: Option<oneshot::Sender<()>>,
        timed_from: Option<Instant>,
    },
    /// flushes everything and closes the transport, then acknowledges
    Close(oneshot::Sender<()>),
}

/// The connection's single writer. Operations are encoded into a buffer that is written out when
///  it reaches `write_buffer_limit`, when `flush_interval` has passed since the first buffered
///  operation, or on PING and close. Keepalive pings are sent from here as well, and too many
///  unanswered pings end the loop with an error.
///
/// Returns `Ok` when closed on request or when all command senders are gone.
pub(crate) async fn write_loop(
    mut writer: Box<dyn TransportWriter>,
    mut commands: mpsc::Receiver<WriterCommand>,
    config: Arc<ConnectionConfig>,
    state: Arc<StateCell>,
) -> io::Result<()> {
    let mut buf = BytesMut::with_capacity(config.write_buffer_limit);
    let mut flush_deadline: Option<Instant> = None;

    let mut keepalive = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            cmd = commands.recv() => match cmd {
                Some(WriterCommand::Op(op)) => {
                    append(&mut buf, &op, &state)?;
                    if buf.len() >= config.write_buffer_limit {
                        write_out(&mut writer, &mut buf).await?;
                        flush_deadline = None;
                    }
                    else if flush_deadline.is_none() {
                        flush_deadline = Some(Instant::now() + config.flush_interval);
                    }
                }
                Some(WriterCommand::Ping { waiter, timed_from }) => {
                    append(&mut buf, &Operation::Ping, &state)?;
                    state.push_pending_ping(waiter, timed_from);
                    write_out(&mut writer, &mut buf).await?;
                    flush_deadline = None;
                }
                Some(WriterCommand::Close(ack)) => {
                    debug!("closing transport");
                    let result = write_out(&mut writer, &mut buf).await;
                    let _ = writer.close().await;
                    let _ = ack.send(());
                    return result;
                }
                None => {
                    trace!("all command senders are gone");
                    let result = write_out(&mut writer, &mut buf).await;
                    let _ = writer.close().await;
                    return result;
                }
            },
            _ = sleep_until(flush_deadline.unwrap_or_else(Instant::now)), if flush_deadline.is_some() => {
                write_out(&mut writer, &mut buf).await?;
                flush_deadline = None;
            }
            _ = keepalive.tick() => {
                let outstanding = state.pings_outstanding();
                if outstanding >= config.max_pings_outstanding {
                    warn!("{} pings without a response, connection is stale", outstanding);
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "stale connection"));
                }
                trace!("sending keepalive ping");
                append(&mut buf, &Operation::Ping, &state)?;
                state.push_pending_ping(None, None);
                write_out(&mut writer, &mut buf).await?;
                flush_deadline = None;
            }
        }
    }
}

fn append(buf: &mut BytesMut, op: &Operation, state: &StateCell) -> io::Result<()> {
    encode(op, buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    if matches!(op, Operation::Pub(_) | Operation::HPub(_)) {
        state.incr_messages_out();
    }
    Ok(())
}

async fn write_out(writer: &mut Box<dyn TransportWriter>, buf: &mut BytesMut) -> io::Result<()> {
    if buf.is_empty() {
        return Ok(());
    }
    trace!("writing {} bytes", buf.len());
    writer.write(buf).await?;
    writer.flush().await?;
    buf.clear();
    Ok(())
}
