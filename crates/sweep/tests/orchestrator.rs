//! Sweep orchestrator flows against in-process fakes

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::{Amount, Network};
use common::{Harness, SWEEP_FEE};
use sweep::settings::{Server, Settings, SweepConfig};
use sweep::{AutoConfirm, SweepOrchestrator, SweepState, TapDriver, TapPrompter};
use sweep_common::{
    BroadcastError, ConfirmationTarget, Error, ErrorKind, HardwareError, NetworkingError,
    SignaturePlan, SignedOutcome, SweepError, TransactionRepository,
};
use sweep_fake::signature::{self, Party};
use sweep_fake::{ConfirmationMode, FakeHardware};

#[tokio::test]
async fn test_no_funds_found_never_signs() {
    let harness = Harness::without_hardware().await;
    let mut orchestrator = harness.orchestrator();

    let state = orchestrator.generate().await.unwrap();

    assert_eq!(state, SweepState::NoFundsFound);
    assert!(state.is_terminal());
    assert_eq!(harness.co_signer.calls(), 0);
    assert_eq!(harness.broadcaster.calls(), 0);

    let err = orchestrator.start_sweep().await.unwrap_err();
    assert_eq!(
        err,
        Error::InvalidTransition {
            state: "no_funds_found",
            event: "start_sweep"
        }
    );
}

#[tokio::test]
async fn test_sweep_without_hardware() {
    let harness = Harness::without_hardware().await;
    harness.fund_retired().await;
    let mut orchestrator = harness.orchestrator();

    let state = orchestrator.generate().await.unwrap();
    let batch = state.batch().cloned().expect("batch generated");
    assert_eq!(batch.len(), 2);
    assert!(batch
        .sweeps()
        .iter()
        .all(|s| s.plan == SignaturePlan::AppAndServer));

    let state = orchestrator.start_sweep().await.unwrap();
    let SweepState::SweepComplete(summary) = state else {
        panic!("expected completion, got {}", state.name());
    };

    assert_eq!(summary.outcomes.len(), 2);
    assert_eq!(summary.total_fee, SWEEP_FEE * 2);
    assert_eq!(summary.outcomes[0].key_set, harness.key_sets[0].id);
    assert_eq!(summary.outcomes[1].key_set, harness.key_sets[1].id);
    assert_eq!(summary.outcomes[1].amount, Amount::from_sat(29_500));
    assert_eq!(harness.repository.outcomes().await, summary.outcomes);

    assert_eq!(
        harness.chain.balance(&harness.active().id).await,
        Amount::from_sat(49_000)
    );
    for key_set in harness.retired() {
        assert_eq!(harness.chain.balance(&key_set.id).await, Amount::ZERO);
    }
    assert_eq!(harness.co_signer.calls(), 2);
}

#[tokio::test]
async fn test_hardware_plan_waits_for_signed_payloads() {
    let harness = Harness::new();
    harness
        .wallets
        .cache_hardware_authorization(&harness.key_sets[0].id)
        .await;
    harness.fund_retired().await;
    let mut orchestrator = harness.orchestrator();

    orchestrator.generate().await.unwrap();
    let state = orchestrator.start_sweep().await.unwrap();
    let SweepState::AwaitingHardwareSignedSweeps { batch } = state else {
        panic!("expected hardware wait, got {}", state.name());
    };
    assert_eq!(batch.hardware_required().len(), 1);
    let hardware_txid = batch.sweeps()[1].txid;

    // Nothing signed yet: rejected and the state is kept
    let err = orchestrator
        .submit_hardware_signed(HashMap::new())
        .await
        .unwrap_err();
    assert_eq!(err, Error::MissingHardwareSignature(hardware_txid));
    assert_eq!(
        orchestrator.state().name(),
        "awaiting_hardware_signed_sweeps"
    );
    assert_eq!(harness.broadcaster.calls(), 0);

    let hardware = Arc::new(FakeHardware::new(ConfirmationMode::TwoTap));
    let driver = TapDriver::new(hardware.clone(), Arc::new(AutoConfirm));
    let mut signed = HashMap::new();
    driver
        .sign_sweeps(hardware.as_ref(), &batch, &mut signed)
        .await
        .unwrap();
    assert_eq!(signed.len(), 1);
    assert_eq!(hardware.taps(), 2);
    assert_eq!(hardware.open_sessions(), 0);

    let state = orchestrator.submit_hardware_signed(signed).await.unwrap();
    assert!(matches!(state, SweepState::SweepComplete(_)));

    let accepted = harness.broadcaster.accepted().await;
    assert_eq!(accepted.len(), 2);
    assert!(!signature::is_signed_by(&accepted[0], Party::Hardware));
    assert!(signature::is_signed_by(&accepted[1], Party::Hardware));
}

#[tokio::test]
async fn test_emulated_prompt_hardware_flow() {
    let harness = Harness::new();
    harness.fund_retired().await;
    let mut orchestrator = harness.orchestrator();

    orchestrator.generate().await.unwrap();
    let state = orchestrator.start_sweep().await.unwrap();
    let batch = state.batch().cloned().expect("batch kept while waiting");

    let hardware = Arc::new(FakeHardware::new(ConfirmationMode::EmulatedPrompt));
    let driver = TapDriver::new(hardware.clone(), Arc::new(AutoConfirm));
    let mut signed = HashMap::new();
    driver
        .sign_sweeps(hardware.as_ref(), &batch, &mut signed)
        .await
        .unwrap();
    assert_eq!(signed.len(), 2);
    assert_eq!(hardware.approvals(), 2);

    let state = orchestrator.submit_hardware_signed(signed).await.unwrap();
    let SweepState::SweepComplete(summary) = state else {
        panic!("expected completion");
    };
    assert_eq!(summary.outcomes.len(), 2);
}

/// Locks the device while the user confirms tap number `lock_at`
struct LockOnConfirmation {
    hardware: Arc<FakeHardware>,
    lock_at: usize,
    confirmations: AtomicUsize,
}

#[async_trait]
impl TapPrompter for LockOnConfirmation {
    async fn request_confirmation(&self, _tap: usize) -> Result<(), HardwareError> {
        let count = self.confirmations.fetch_add(1, Ordering::SeqCst) + 1;
        if count == self.lock_at {
            self.hardware.set_locked(true);
        }
        Ok(())
    }

    async fn choose(&self, _labels: &[String]) -> Result<usize, HardwareError> {
        Ok(0)
    }
}

#[tokio::test]
async fn test_hardware_error_keeps_signed_sweeps() {
    let harness = Harness::new();
    harness.fund_retired().await;
    let mut orchestrator = harness.orchestrator();

    orchestrator.generate().await.unwrap();
    let state = orchestrator.start_sweep().await.unwrap();
    let batch = state.batch().cloned().expect("batch kept while waiting");
    assert_eq!(batch.hardware_required().len(), 2);

    // The device locks during the second sweep
    let hardware = Arc::new(FakeHardware::new(ConfirmationMode::TwoTap));
    let prompter = Arc::new(LockOnConfirmation {
        hardware: hardware.clone(),
        lock_at: 2,
        confirmations: AtomicUsize::new(0),
    });
    let driver = TapDriver::new(hardware.clone(), prompter);

    let mut signed = HashMap::new();
    let err = driver
        .sign_sweeps(hardware.as_ref(), &batch, &mut signed)
        .await
        .unwrap_err();
    assert_eq!(err, HardwareError::Locked);
    assert_eq!(signed.len(), 1);
    assert!(signed.contains_key(&batch.sweeps()[0].txid));
    assert_eq!(hardware.open_sessions(), 0);

    // Tapping again only signs the remaining sweep
    hardware.set_locked(false);
    let taps = hardware.taps();
    let driver = TapDriver::new(hardware.clone(), Arc::new(AutoConfirm));
    driver
        .sign_sweeps(hardware.as_ref(), &batch, &mut signed)
        .await
        .unwrap();
    assert_eq!(signed.len(), 2);
    assert_eq!(hardware.taps() - taps, 2);

    let state = orchestrator.submit_hardware_signed(signed).await.unwrap();
    assert!(matches!(state, SweepState::SweepComplete(_)));
}

#[tokio::test]
async fn test_mismatched_hardware_payload_rejected() {
    let harness = Harness::new();
    harness.fund_retired().await;
    let mut orchestrator = harness.orchestrator();

    orchestrator.generate().await.unwrap();
    let state = orchestrator.start_sweep().await.unwrap();
    let batch = state.batch().cloned().expect("batch");
    let first = &batch.sweeps()[0];
    let second = &batch.sweeps()[1];

    let signed = HashMap::from([
        (first.txid, signature::sign(&first.psbt, Party::Hardware)),
        (second.txid, signature::sign(&first.psbt, Party::Hardware)),
    ]);
    let err = orchestrator
        .submit_hardware_signed(signed)
        .await
        .unwrap_err();

    assert_eq!(err, Error::HardwarePayloadMismatch(second.txid));
    assert_eq!(orchestrator.state().batch(), Some(&batch));
}

#[tokio::test]
async fn test_broadcast_failure_keeps_completed_and_retry_regenerates() {
    let harness = Harness::without_hardware().await;
    harness.fund_retired().await;
    harness
        .broadcaster
        .fail_call(2, BroadcastError::Rejected("mempool full".to_string()))
        .await;
    let mut orchestrator = harness.orchestrator();

    orchestrator.generate().await.unwrap();
    let first_attempt = orchestrator.attempt_id();
    let state = orchestrator.start_sweep().await.unwrap();

    let SweepState::SweepFailed(failure) = state else {
        panic!("expected failure, got {}", state.name());
    };
    assert_eq!(
        failure.cause,
        Error::Broadcast(BroadcastError::Rejected("mempool full".to_string()))
    );
    assert_eq!(failure.completed.len(), 1);
    assert_eq!(failure.completed[0].key_set, harness.key_sets[0].id);

    let failed_sweep = failure.failed_sweep.expect("failed sweep kept");
    assert_eq!(failed_sweep.source.id, harness.key_sets[1].id);
    assert!(signature::is_signed_by(&failed_sweep.psbt, Party::App));
    assert!(signature::is_signed_by(&failed_sweep.psbt, Party::Server));

    // The first sweep reached the network and the ledger
    assert_eq!(harness.repository.outcomes().await, failure.completed);

    let state = orchestrator.retry().await.unwrap();
    assert_ne!(orchestrator.attempt_id(), first_attempt);
    let batch = state.batch().cloned().expect("remaining sweep regenerated");
    assert_eq!(batch.len(), 1);
    assert_eq!(batch.sweeps()[0].source.id, harness.key_sets[1].id);

    let state = orchestrator.start_sweep().await.unwrap();
    assert!(matches!(state, SweepState::SweepComplete(_)));
    assert_eq!(harness.repository.outcomes().await.len(), 2);
}

#[tokio::test]
async fn test_co_sign_failure_keeps_app_signature() {
    let harness = Harness::without_hardware().await;
    harness.fund_retired().await;
    harness
        .co_signer
        .set_failure(Some(NetworkingError::Timeout))
        .await;
    let mut orchestrator = harness.orchestrator();

    orchestrator.generate().await.unwrap();
    let state = orchestrator.start_sweep().await.unwrap();

    let SweepState::SweepFailed(failure) = state else {
        panic!("expected failure");
    };
    assert_eq!(failure.cause, Error::Networking(NetworkingError::Timeout));
    assert!(failure.cause.is_retryable());
    assert!(failure.completed.is_empty());

    let failed_sweep = failure.failed_sweep.expect("failed sweep kept");
    assert_eq!(failed_sweep.source.id, harness.key_sets[0].id);
    assert!(signature::is_signed_by(&failed_sweep.psbt, Party::App));
    assert!(!signature::is_signed_by(&failed_sweep.psbt, Party::Server));
    assert_eq!(harness.broadcaster.calls(), 0);
}

#[tokio::test]
async fn test_app_signing_failure() {
    let harness = Harness::without_hardware().await;
    harness.fund_retired().await;
    harness.wallets.fail_sign_for(&harness.key_sets[0].id).await;
    let mut orchestrator = harness.orchestrator();

    orchestrator.generate().await.unwrap();
    let state = orchestrator.start_sweep().await.unwrap();

    let cause = state.cause().expect("failed with a cause");
    assert_eq!(cause.kind(), ErrorKind::Signing);
    assert_eq!(harness.co_signer.calls(), 0);
}

#[tokio::test]
async fn test_generation_failure_then_retry() {
    let harness = Harness::without_hardware().await;
    harness.fund_retired().await;
    harness.wallets.set_fail_listing(true);
    let mut orchestrator = harness.orchestrator();

    let state = orchestrator.generate().await.unwrap();
    assert!(matches!(
        state.cause(),
        Some(Error::Sweep(SweepError::FailedToListKeySets(_)))
    ));
    assert!(!state.is_terminal());

    harness.wallets.set_fail_listing(false);
    let state = orchestrator.retry().await.unwrap();
    assert_eq!(state.name(), "psbts_generated");
}

#[tokio::test]
async fn test_cancel_before_broadcast() {
    let harness = Harness::without_hardware().await;
    harness.fund_retired().await;
    let mut orchestrator = harness.orchestrator();

    orchestrator.generate().await.unwrap();
    assert_eq!(orchestrator.cancel().unwrap(), SweepState::Cancelled);
    assert_eq!(harness.broadcaster.calls(), 0);

    let err = orchestrator.cancel().unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_cancel_while_awaiting_hardware() {
    let harness = Harness::new();
    harness.fund_retired().await;
    let mut orchestrator = harness.orchestrator();

    orchestrator.generate().await.unwrap();
    let state = orchestrator.start_sweep().await.unwrap();
    assert_eq!(state.name(), "awaiting_hardware_signed_sweeps");

    assert_eq!(orchestrator.cancel().unwrap(), SweepState::Cancelled);
    assert!(orchestrator.state().is_terminal());

    let err = orchestrator
        .submit_hardware_signed(HashMap::new())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        Error::InvalidTransition {
            state: "cancelled",
            event: "submit_hardware_signed"
        }
    );
    assert_eq!(harness.co_signer.calls(), 0);
    assert_eq!(harness.broadcaster.calls(), 0);
    assert_eq!(
        harness.chain.balance(&harness.key_sets[1].id).await,
        Amount::from_sat(30_000)
    );
}

#[tokio::test]
async fn test_cancel_before_generation_runs() {
    let harness = Harness::without_hardware().await;
    harness.fund_retired().await;
    let mut orchestrator = harness.orchestrator();
    assert_eq!(orchestrator.state(), SweepState::GeneratingPsbts);

    assert_eq!(orchestrator.cancel().unwrap(), SweepState::Cancelled);

    let err = orchestrator.generate().await.unwrap_err();
    assert_eq!(
        err,
        Error::InvalidTransition {
            state: "cancelled",
            event: "generate"
        }
    );
    assert!(harness.repository.outcomes().await.is_empty());
}

#[tokio::test]
async fn test_cancel_after_completion_rejected() {
    let harness = Harness::without_hardware().await;
    harness.fund_retired().await;
    let mut orchestrator = harness.orchestrator();

    orchestrator.generate().await.unwrap();
    orchestrator.start_sweep().await.unwrap();

    let err = orchestrator.cancel().unwrap_err();
    assert_eq!(
        err,
        Error::InvalidTransition {
            state: "sweep_complete",
            event: "cancel"
        }
    );
}

#[tokio::test]
async fn test_generate_after_completion_finds_nothing() {
    let harness = Harness::without_hardware().await;
    harness.fund_retired().await;

    let mut orchestrator = harness.orchestrator();
    orchestrator.generate().await.unwrap();
    orchestrator.start_sweep().await.unwrap();

    let mut again = harness.orchestrator();
    assert_eq!(again.generate().await.unwrap(), SweepState::NoFundsFound);
    assert_eq!(harness.broadcaster.calls(), 2);
}

#[tokio::test]
async fn test_recorded_sweeps_are_not_regenerated() {
    let harness = Harness::without_hardware().await;
    harness.fund_retired().await;

    let mut interrupted = harness.orchestrator();
    let state = interrupted.generate().await.unwrap();
    let batch = state.batch().cloned().expect("batch");
    let recorded = &batch.sweeps()[0];

    // Broadcast landed but the attempt died before moving on
    harness
        .repository
        .set_transaction(SignedOutcome {
            txid: recorded.txid,
            key_set: recorded.source.id.clone(),
            fee: recorded.fee,
            amount: recorded.sweep_amount().expect("positive"),
            broadcast_time: 1_700_000_000,
            exchange_rate: None,
        })
        .await
        .unwrap();

    let mut resumed = harness.orchestrator();
    let state = resumed.generate().await.unwrap();
    let batch = state.batch().cloned().expect("remaining batch");
    assert_eq!(batch.len(), 1);
    assert_eq!(batch.sweeps()[0].source.id, harness.key_sets[1].id);
}

#[tokio::test]
async fn test_orchestrator_from_settings() {
    let harness = Harness::without_hardware().await;
    harness.fund_retired().await;

    let settings = Settings {
        network: Network::Regtest,
        server: Server {
            account_id: "acct-1".to_string(),
            url: "https://cosigner.test".to_string(),
            ..Default::default()
        },
        sweep: SweepConfig {
            confirmation_target_blocks: 6,
            ..Default::default()
        },
        ..Default::default()
    };

    let mut orchestrator =
        SweepOrchestrator::from_settings(&settings, harness.services()).unwrap();
    orchestrator.generate().await.unwrap();

    assert_eq!(orchestrator.account_id(), &harness.account_id());
    assert_eq!(
        harness.fees.last_target().await,
        Some(ConfirmationTarget::new(6))
    );
}

#[tokio::test]
async fn test_wrong_network_fails_generation() {
    let harness = Harness::without_hardware().await;
    harness.fund_retired().await;

    let mut orchestrator = harness.orchestrator().with_network(Network::Bitcoin);
    let state = orchestrator.generate().await.unwrap();

    assert!(matches!(
        state.cause(),
        Some(Error::Sweep(SweepError::FailedToResolveDestination(_)))
    ));
}
