//! Orchestrator actor
//!
//! Runs a [`SweepOrchestrator`] on its own task and feeds it typed commands
//! over a channel, so events are applied strictly one at a time. Every state
//! is published on a watch channel. At most one actor runs per account.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use bitcoin::{Psbt, Txid};
use sweep_common::{AccountId, Error};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::{SweepOrchestrator, SweepState};

const COMMAND_BUFFER: usize = 16;

type Reply = oneshot::Sender<Result<SweepState, Error>>;

#[derive(Debug)]
enum SweepCommand {
    /// User confirmed the sweep
    StartSweep { response: Reply },
    /// Hardware round-trip finished
    SubmitHardwareSigned {
        signed: HashMap<Txid, Psbt>,
        response: Reply,
    },
    /// Regenerate after a failure
    Retry { response: Reply },
    /// Abandon before broadcasting
    Cancel { response: Reply },
    /// Stop the actor
    Shutdown,
}

/// Accounts with a running sweep
#[derive(Debug, Clone, Default)]
pub struct AccountLocks {
    inner: Arc<Mutex<HashSet<AccountId>>>,
}

impl AccountLocks {
    /// Create new [`AccountLocks`]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `account_id`, failing if a sweep already holds it
    pub fn acquire(&self, account_id: &AccountId) -> Result<AccountLockGuard, Error> {
        let mut held = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.insert(account_id.clone()) {
            return Err(Error::SweepInProgress(account_id.clone()));
        }
        Ok(AccountLockGuard {
            locks: self.clone(),
            account_id: account_id.clone(),
        })
    }

    /// Whether a sweep holds `account_id`
    pub fn is_locked(&self, account_id: &AccountId) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(account_id)
    }
}

/// Releases the account when dropped
#[derive(Debug)]
pub struct AccountLockGuard {
    locks: AccountLocks,
    account_id: AccountId,
}

impl Drop for AccountLockGuard {
    fn drop(&mut self) {
        self.locks
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.account_id);
        tracing::debug!("Released sweep lock for account {}", self.account_id);
    }
}

/// Spawns orchestrator actors
#[derive(Debug)]
pub struct SweepActor;

impl SweepActor {
    /// Spawn an actor for the orchestrator's account and start generating.
    ///
    /// The actor stops, releasing the account, once a terminal state is
    /// reached, on shutdown, or when every handle is dropped.
    pub fn spawn(
        mut orchestrator: SweepOrchestrator,
        locks: &AccountLocks,
    ) -> Result<SweepHandle, Error> {
        let guard = locks.acquire(orchestrator.account_id())?;
        let account_id = orchestrator.account_id().clone();
        let state = orchestrator.subscribe();
        let (sender, mut receiver) = mpsc::channel(COMMAND_BUFFER);

        let task = tokio::spawn(async move {
            let _guard = guard;

            let mut running =
                generate_or_cancel(&mut orchestrator, &mut receiver).await == Generation::Settled;

            while running && !orchestrator.state().is_terminal() {
                let Some(command) = receiver.recv().await else {
                    break;
                };

                match command {
                    SweepCommand::StartSweep { response } => {
                        let result = orchestrator.start_sweep().await;
                        reply(response, result);
                    }
                    SweepCommand::SubmitHardwareSigned { signed, response } => {
                        let result = orchestrator.submit_hardware_signed(signed).await;
                        reply(response, result);
                    }
                    SweepCommand::Retry { response } => {
                        if let Err(err) = orchestrator.restart() {
                            reply(response, Err(err));
                            continue;
                        }
                        running = generate_or_cancel(&mut orchestrator, &mut receiver).await
                            == Generation::Settled;
                        reply(response, Ok(orchestrator.state()));
                    }
                    SweepCommand::Cancel { response } => {
                        let result = orchestrator.cancel();
                        reply(response, result);
                    }
                    SweepCommand::Shutdown => {
                        tracing::info!("Sweep actor shutting down");
                        break;
                    }
                }
            }

            tracing::info!(
                "Sweep actor for account {} stopped in state {}",
                orchestrator.account_id(),
                orchestrator.state().name()
            );
        });

        Ok(SweepHandle {
            account_id,
            sender,
            state,
            task,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Generation {
    /// Generation finished or was cancelled
    Settled,
    /// Shutdown or every handle dropped mid-generation
    Stopped,
}

/// Run a generation pass while still serving commands.
///
/// A `Cancel` drops the in-flight pass and cancels the sweep. Other events
/// are rejected until the pass settles.
async fn generate_or_cancel(
    orchestrator: &mut SweepOrchestrator,
    receiver: &mut mpsc::Receiver<SweepCommand>,
) -> Generation {
    let cancel = {
        let generation = orchestrator.generate();
        tokio::pin!(generation);

        loop {
            tokio::select! {
                result = &mut generation => {
                    if let Err(err) = result {
                        tracing::error!("Generation rejected: {}", err);
                    }
                    return Generation::Settled;
                }
                command = receiver.recv() => match command {
                    Some(SweepCommand::Cancel { response }) => break response,
                    Some(SweepCommand::StartSweep { response }) => {
                        reply(response, Err(busy_generating("start_sweep")));
                    }
                    Some(SweepCommand::SubmitHardwareSigned { response, .. }) => {
                        reply(response, Err(busy_generating("submit_hardware_signed")));
                    }
                    Some(SweepCommand::Retry { response }) => {
                        reply(response, Err(busy_generating("retry")));
                    }
                    Some(SweepCommand::Shutdown) | None => {
                        tracing::info!("Sweep actor stopping during generation");
                        return Generation::Stopped;
                    }
                },
            }
        }
    };

    tracing::info!("Generation interrupted by cancel");
    let result = orchestrator.cancel();
    reply(cancel, result);
    Generation::Settled
}

fn busy_generating(event: &'static str) -> Error {
    let state = SweepState::GeneratingPsbts.name();
    tracing::warn!("Rejected `{}` in state `{}`", event, state);
    Error::InvalidTransition { state, event }
}

fn reply(response: Reply, result: Result<SweepState, Error>) {
    if response.send(result).is_err() {
        tracing::warn!("Sweep command caller went away before the reply");
    }
}

/// Handle to a running sweep actor
#[derive(Debug)]
pub struct SweepHandle {
    account_id: AccountId,
    sender: mpsc::Sender<SweepCommand>,
    state: watch::Receiver<SweepState>,
    task: JoinHandle<()>,
}

impl SweepHandle {
    /// Account being swept
    pub fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    /// Latest published state
    pub fn state(&self) -> SweepState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every transition
    pub fn subscribe(&self) -> watch::Receiver<SweepState> {
        self.state.clone()
    }

    /// Wait until a state matches `predicate`.
    ///
    /// Returns the last published state if the actor stops first.
    pub async fn wait_for<F>(&self, predicate: F) -> SweepState
    where
        F: Fn(&SweepState) -> bool,
    {
        let mut state = self.state.clone();
        if let Ok(matched) = state.wait_for(|s| predicate(s)).await {
            return matched.clone();
        }
        let last = state.borrow().clone();
        last
    }

    /// Wait until the actor waits for the caller again
    pub async fn settled(&self) -> SweepState {
        self.wait_for(SweepState::is_settled).await
    }

    async fn request<F>(&self, command: F) -> Result<SweepState, Error>
    where
        F: FnOnce(Reply) -> SweepCommand,
    {
        let (response, receiver) = oneshot::channel();
        self.sender
            .send(command(response))
            .await
            .map_err(|_| Error::ActorStopped)?;
        receiver.await.map_err(|_| Error::ActorStopped)?
    }

    /// User confirmed the sweep
    pub async fn start_sweep(&self) -> Result<SweepState, Error> {
        self.request(|response| SweepCommand::StartSweep { response })
            .await
    }

    /// Submit hardware-signed payloads keyed by txid
    pub async fn submit_hardware_signed(
        &self,
        signed: HashMap<Txid, Psbt>,
    ) -> Result<SweepState, Error> {
        self.request(|response| SweepCommand::SubmitHardwareSigned { signed, response })
            .await
    }

    /// Regenerate after a failure
    pub async fn retry(&self) -> Result<SweepState, Error> {
        self.request(|response| SweepCommand::Retry { response })
            .await
    }

    /// Abandon the sweep
    pub async fn cancel(&self) -> Result<SweepState, Error> {
        self.request(|response| SweepCommand::Cancel { response })
            .await
    }

    /// Stop the actor and wait until it released the account
    pub async fn shutdown(self) {
        // The actor may already have stopped on a terminal state
        let _ = self.sender.send(SweepCommand::Shutdown).await;
        if let Err(err) = self.task.await {
            tracing::error!("Sweep actor task failed: {}", err);
        }
    }
}
