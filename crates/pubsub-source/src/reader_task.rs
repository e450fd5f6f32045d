//! Single-owner tokio task that drives a [`SourceReader`].
//!
//! The task owns the reader exclusively. Engine calls arrive as
//! [`ReaderCommand`]s and are handled between polls, ahead of the next
//! poll, so a snapshot always covers exactly the records already sent
//! downstream. A fatal error stops the task and is returned from
//! [`ReaderTaskHandle::wait`].

use std::ops::ControlFlow;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::PubSubError;
use crate::source_reader::{InputStatus, SourceReader};
use crate::split::SubscriptionSplit;

/// Tuning for the reader task.
#[derive(Debug, Clone)]
pub struct ReaderTaskConfig {
    /// Capacity of the command channel.
    pub command_capacity: usize,
    /// Sleep between polls when nothing was available.
    pub idle_poll_interval: Duration,
    /// Sleep after a transient poll failure.
    pub error_backoff: Duration,
}

impl Default for ReaderTaskConfig {
    fn default() -> Self {
        Self {
            command_capacity: 64,
            idle_poll_interval: Duration::from_millis(10),
            error_backoff: Duration::from_millis(100),
        }
    }
}

/// Engine call forwarded to the reader task.
#[derive(Debug)]
pub enum ReaderCommand {
    /// Assign splits.
    AddSplits(Vec<SubscriptionSplit>),
    /// Begin a checkpoint and reply with the splits to persist.
    Snapshot {
        /// Checkpoint being taken.
        checkpoint_id: u64,
        /// Reply channel.
        reply: oneshot::Sender<Result<Vec<SubscriptionSplit>, PubSubError>>,
    },
    /// A checkpoint is durable.
    CheckpointComplete {
        /// Completed checkpoint.
        checkpoint_id: u64,
        /// Reply channel.
        reply: oneshot::Sender<Result<(), PubSubError>>,
    },
    /// Close the reader and stop.
    Shutdown,
}

/// Handle to a running reader task.
#[derive(Debug)]
pub struct ReaderTaskHandle {
    commands: mpsc::Sender<ReaderCommand>,
    join: JoinHandle<Result<(), PubSubError>>,
}

impl ReaderTaskHandle {
    /// Assigns splits to the reader.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::Shutdown`] if the task has stopped.
    pub async fn add_splits(&self, splits: Vec<SubscriptionSplit>) -> Result<(), PubSubError> {
        self.commands
            .send(ReaderCommand::AddSplits(splits))
            .await
            .map_err(|_| PubSubError::Shutdown)
    }

    /// Takes a snapshot for `checkpoint_id`.
    ///
    /// # Errors
    ///
    /// Returns the reader's error, or [`PubSubError::Shutdown`] if the task
    /// has stopped.
    pub async fn snapshot_state(
        &self,
        checkpoint_id: u64,
    ) -> Result<Vec<SubscriptionSplit>, PubSubError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(ReaderCommand::Snapshot {
                checkpoint_id,
                reply,
            })
            .await
            .map_err(|_| PubSubError::Shutdown)?;
        rx.await.map_err(|_| PubSubError::Shutdown)?
    }

    /// Reports `checkpoint_id` as durable.
    ///
    /// # Errors
    ///
    /// Returns the reader's error, or [`PubSubError::Shutdown`] if the task
    /// has stopped.
    pub async fn notify_checkpoint_complete(&self, checkpoint_id: u64) -> Result<(), PubSubError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(ReaderCommand::CheckpointComplete {
                checkpoint_id,
                reply,
            })
            .await
            .map_err(|_| PubSubError::Shutdown)?;
        rx.await.map_err(|_| PubSubError::Shutdown)?
    }

    /// Returns `true` once the task has stopped.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Asks the task to close the reader and waits for it to stop.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped the task, if any.
    pub async fn shutdown(self) -> Result<(), PubSubError> {
        let _ = self.commands.send(ReaderCommand::Shutdown).await;
        self.wait().await
    }

    /// Waits for the task to stop on its own.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped the task, if any.
    pub async fn wait(self) -> Result<(), PubSubError> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(PubSubError::InvalidState {
                expected: "reader task to exit cleanly".into(),
                actual: e.to_string(),
            }),
        }
    }
}

/// Spawns a task that polls `reader` and sends emitted records to
/// `records` in batches.
///
/// The task stops on [`ReaderCommand::Shutdown`], when every handle and the
/// records receiver are dropped, or on a non-transient error.
#[must_use]
pub fn spawn_reader_task<S>(
    reader: S,
    records: mpsc::Sender<Vec<S::Output>>,
    config: ReaderTaskConfig,
) -> ReaderTaskHandle
where
    S: SourceReader + 'static,
    S::Output: 'static,
{
    let (commands, rx) = mpsc::channel(config.command_capacity);
    let join = tokio::spawn(run_reader(reader, rx, records, config));
    ReaderTaskHandle { commands, join }
}

async fn run_reader<S>(
    mut reader: S,
    mut commands: mpsc::Receiver<ReaderCommand>,
    records: mpsc::Sender<Vec<S::Output>>,
    config: ReaderTaskConfig,
) -> Result<(), PubSubError>
where
    S: SourceReader,
{
    info!("source reader task started");

    let result = loop {
        match drain_commands(&mut reader, &mut commands) {
            Ok(ControlFlow::Continue(())) => {}
            Ok(ControlFlow::Break(())) => break Ok(()),
            Err(e) => break Err(e),
        }

        let mut buffer = Vec::new();
        match reader.poll_next(&mut buffer).await {
            Ok(InputStatus::MoreAvailable) => {
                if !buffer.is_empty() && records.send(buffer).await.is_err() {
                    debug!("records receiver dropped, stopping");
                    break Ok(());
                }
            }
            Ok(InputStatus::NothingAvailable) => {
                tokio::select! {
                    biased;
                    command = commands.recv() => match handle_command(&mut reader, command) {
                        Ok(ControlFlow::Continue(())) => {}
                        Ok(ControlFlow::Break(())) => break Ok(()),
                        Err(e) => break Err(e),
                    },
                    () = tokio::time::sleep(config.idle_poll_interval) => {}
                }
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, "poll failed, retrying");
                tokio::time::sleep(config.error_backoff).await;
            }
            Err(e) => {
                error!(error = %e, "source reader failed");
                break Err(e);
            }
        }
    };

    let closed = reader.close().await;
    info!(failed = result.is_err(), "source reader task stopped");
    result.and(closed)
}

/// Handles every queued command without waiting.
fn drain_commands<S: SourceReader>(
    reader: &mut S,
    commands: &mut mpsc::Receiver<ReaderCommand>,
) -> Result<ControlFlow<()>, PubSubError> {
    loop {
        match commands.try_recv() {
            Ok(command) => {
                if handle_command(reader, Some(command))?.is_break() {
                    return Ok(ControlFlow::Break(()));
                }
            }
            Err(mpsc::error::TryRecvError::Empty) => return Ok(ControlFlow::Continue(())),
            Err(mpsc::error::TryRecvError::Disconnected) => return Ok(ControlFlow::Break(())),
        }
    }
}

fn handle_command<S: SourceReader>(
    reader: &mut S,
    command: Option<ReaderCommand>,
) -> Result<ControlFlow<()>, PubSubError> {
    match command {
        None | Some(ReaderCommand::Shutdown) => Ok(ControlFlow::Break(())),
        Some(ReaderCommand::AddSplits(splits)) => {
            reader.add_splits(splits);
            Ok(ControlFlow::Continue(()))
        }
        Some(ReaderCommand::Snapshot {
            checkpoint_id,
            reply,
        }) => {
            let result = reader.snapshot_state(checkpoint_id);
            let fatal = result.as_ref().err().filter(|e| e.is_fatal()).cloned();
            let _ = reply.send(result);
            fatal.map_or(Ok(ControlFlow::Continue(())), Err)
        }
        Some(ReaderCommand::CheckpointComplete {
            checkpoint_id,
            reply,
        }) => {
            let result = reader.notify_checkpoint_complete(checkpoint_id);
            let fatal = result.as_ref().err().filter(|e| e.is_fatal()).cloned();
            let _ = reply.send(result);
            fatal.map_or(Ok(ControlFlow::Continue(())), Err)
        }
    }
}
