//! Device Loss & Recovery Integration Tests
//!
//! Tests for:
//! - Loss of the active / a suspended session
//! - Handle invalidation across generations
//! - Lazy recovery via switch_to and explicit recover
//! - Retry-once semantics when a device dies during activation
//! - Recovery while the adapter is unavailable

use gpu_session::gpu::AcquireError;
use gpu_session::{
    Generation, HeadlessBinding, ManagerSettings, ResourceDescriptor, SessionConfig,
    SessionError, SessionId, SessionManager, SessionState, SuspendPolicy, SwitchFailure,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn setup(policy: SuspendPolicy) -> (SessionManager<HeadlessBinding>, HeadlessBinding) {
    init_logger();
    let binding = HeadlessBinding::new();
    let settings = ManagerSettings {
        suspend_policy: policy,
        ..Default::default()
    };
    (SessionManager::new(binding.clone(), settings), binding)
}

fn create(m: &SessionManager<HeadlessBinding>) -> SessionId {
    m.create_session(SessionConfig::default()).unwrap()
}

// ============================================================================
// Loss handling
// ============================================================================

#[test]
fn losing_active_device_invalidates_session() {
    let (m, binding) = setup(SuspendPolicy::RetainOnSuspend);
    let a = create(&m);
    m.switch_to(a).unwrap();
    let handle = m.register_resource(a, ResourceDescriptor::buffer(256)).unwrap();

    assert!(binding.lose_device(a));

    assert_eq!(m.active_session(), None);
    assert_eq!(m.session_state(a).unwrap(), SessionState::Invalidated);
    assert_eq!(m.pending_recovery(), vec![a]);
    assert!(matches!(
        m.lookup_resource(handle),
        Err(SessionError::StaleHandle { .. })
    ));
    assert_eq!(
        m.submit(a, |device| device.submit(1)).unwrap_err(),
        SessionError::SessionInvalidated(a)
    );
    assert_eq!(
        m.register_resource(a, ResourceDescriptor::buffer(1)).unwrap_err(),
        SessionError::SessionInvalidated(a)
    );
}

#[test]
fn process_device_loss_reports_invalidated_count() {
    let (m, binding) = setup(SuspendPolicy::RetainOnSuspend);
    let a = create(&m);
    let b = create(&m);
    m.switch_to(a).unwrap();
    m.switch_to(b).unwrap();

    assert!(binding.lose_device(a));
    assert!(binding.lose_device(b));
    assert_eq!(m.process_device_loss(), 2);
    assert_eq!(m.process_device_loss(), 0);
    assert_eq!(m.pending_recovery(), vec![a, b]);
}

#[test]
fn losing_suspended_device_leaves_active_untouched() {
    let (m, binding) = setup(SuspendPolicy::RetainOnSuspend);
    let a = create(&m);
    let b = create(&m);
    m.switch_to(a).unwrap();
    m.switch_to(b).unwrap();

    assert!(binding.lose_device(a));
    assert_eq!(m.active_session(), Some(b));
    assert_eq!(m.session_state(a).unwrap(), SessionState::Invalidated);
    assert_eq!(m.session_state(b).unwrap(), SessionState::Active);
    assert_eq!(m.pending_recovery(), vec![a]);
}

#[test]
fn released_devices_cannot_be_lost() {
    let (m, binding) = setup(SuspendPolicy::ReleaseOnSuspend);
    let a = create(&m);
    let b = create(&m);
    m.switch_to(a).unwrap();
    m.switch_to(b).unwrap();

    assert!(!binding.lose_device(a));
    assert_eq!(m.session_state(a).unwrap(), SessionState::Suspended);
    assert!(m.pending_recovery().is_empty());
}

#[test]
fn switching_away_from_lost_session_proceeds() {
    let (m, binding) = setup(SuspendPolicy::RetainOnSuspend);
    let a = create(&m);
    let b = create(&m);
    m.switch_to(a).unwrap();

    binding.lose_device(a);
    assert_eq!(m.switch_to(b).unwrap(), b);
    assert_eq!(binding.drains(), 0, "a lost device is not drained");
    assert_eq!(m.session_state(a).unwrap(), SessionState::Invalidated);
    assert_eq!(m.active_session(), Some(b));
}

#[test]
fn destroying_invalidated_session_clears_pending() {
    let (m, binding) = setup(SuspendPolicy::RetainOnSuspend);
    let a = create(&m);
    m.switch_to(a).unwrap();
    binding.lose_device(a);

    m.destroy_session(a).unwrap();
    assert!(m.pending_recovery().is_empty());
    assert_eq!(m.session_state(a).unwrap_err(), SessionError::NotFound(a));
    assert_eq!(binding.live_devices(), 0);
}

// ============================================================================
// Recovery
// ============================================================================

#[test]
fn explicit_recover_starts_a_new_generation() {
    let (m, binding) = setup(SuspendPolicy::RetainOnSuspend);
    let a = create(&m);
    m.switch_to(a).unwrap();
    let old = m.register_resource(a, ResourceDescriptor::buffer(16)).unwrap();
    binding.lose_device(a);

    m.recover(a).unwrap();
    let info = m.session_info(a).unwrap();
    assert_eq!(info.state, SessionState::Created);
    assert_eq!(info.generation, Generation::new(1));
    assert_eq!(info.resource_count, 0);
    assert!(m.pending_recovery().is_empty());

    match m.lookup_resource(old).unwrap_err() {
        SessionError::StaleHandle { handle, current } => {
            assert_eq!(handle, old);
            assert_eq!(current, 1);
        }
        other => panic!("expected stale handle, got {other:?}"),
    }

    let fresh = m.register_resource(a, ResourceDescriptor::buffer(16)).unwrap();
    assert_eq!(fresh.generation(), Generation::new(1));
    assert!(m.lookup_resource(fresh).is_ok());

    m.switch_to(a).unwrap();
    assert_eq!(binding.acquisitions(), 2, "recovered device is reused");
}

#[test]
fn recover_is_a_noop_for_healthy_sessions() {
    let (m, binding) = setup(SuspendPolicy::RetainOnSuspend);
    let a = create(&m);
    m.switch_to(a).unwrap();

    m.recover(a).unwrap();
    assert_eq!(m.session_state(a).unwrap(), SessionState::Active);
    assert_eq!(m.session_info(a).unwrap().generation, Generation::default());
    assert_eq!(binding.acquisitions(), 1);
    assert_eq!(
        m.recover(SessionId::from_raw(42)).unwrap_err(),
        SessionError::NotFound(SessionId::from_raw(42))
    );
}

#[test]
fn switch_to_recovers_lazily() {
    let (m, binding) = setup(SuspendPolicy::RetainOnSuspend);
    let a = create(&m);
    m.switch_to(a).unwrap();
    binding.lose_device(a);

    assert_eq!(m.switch_to(a).unwrap(), a);
    let info = m.session_info(a).unwrap();
    assert_eq!(info.state, SessionState::Active);
    assert_eq!(info.generation, Generation::new(1));
    assert!(m.pending_recovery().is_empty());
}

#[test]
fn recovery_waits_for_adapter() {
    let (m, binding) = setup(SuspendPolicy::RetainOnSuspend);
    let a = create(&m);
    m.switch_to(a).unwrap();
    binding.lose_device(a);
    binding.set_adapter_available(false);

    assert!(matches!(
        m.recover(a),
        Err(SessionError::AdapterUnavailable(_))
    ));
    assert_eq!(m.session_state(a).unwrap(), SessionState::Invalidated);
    assert_eq!(m.pending_recovery(), vec![a]);

    assert!(matches!(
        m.switch_to(a),
        Err(SessionError::SwitchFailed {
            reason: SwitchFailure::ActivationFailed(_),
            ..
        })
    ));
    assert_eq!(m.active_session(), None);

    binding.set_adapter_available(true);
    assert_eq!(m.switch_to(a).unwrap(), a);
    assert_eq!(m.session_info(a).unwrap().generation, Generation::new(1));
}

#[test]
fn loss_of_pre_acquired_device_keeps_session_created() {
    let (m, binding) = setup(SuspendPolicy::RetainOnSuspend);
    let a = create(&m);
    m.switch_to(a).unwrap();
    binding.lose_device(a);
    m.recover(a).unwrap();
    assert!(m.session_info(a).unwrap().holds_device);

    assert!(binding.lose_device(a));
    let info = m.session_info(a).unwrap();
    assert_eq!(info.state, SessionState::Created);
    assert!(!info.holds_device);
    assert!(m.pending_recovery().is_empty());

    m.switch_to(a).unwrap();
    assert_eq!(m.session_info(a).unwrap().generation, Generation::new(1));
    assert_eq!(binding.acquisitions(), 3);
}

// ============================================================================
// Loss during activation
// ============================================================================

#[test]
fn loss_during_resume_is_retried_once() {
    let (m, binding) = setup(SuspendPolicy::RetainOnSuspend);
    let a = create(&m);
    let b = create(&m);
    m.switch_to(a).unwrap();
    m.switch_to(b).unwrap();

    binding.fail_next_resume(AcquireError::DeviceLost("reset".into()));
    assert_eq!(m.switch_to(a).unwrap(), a);

    let info = m.session_info(a).unwrap();
    assert_eq!(info.state, SessionState::Active);
    assert_eq!(info.generation, Generation::new(1));
    assert_eq!(m.session_state(b).unwrap(), SessionState::Suspended);
}

#[test]
fn second_loss_during_activation_fails_and_rolls_back() {
    let (m, binding) = setup(SuspendPolicy::RetainOnSuspend);
    let a = create(&m);
    let b = create(&m);
    m.switch_to(a).unwrap();
    m.switch_to(b).unwrap();

    binding.fail_next_resume(AcquireError::DeviceLost("reset".into()));
    binding.fail_next_resume(AcquireError::DeviceLost("reset again".into()));

    match m.switch_to(a).unwrap_err() {
        SessionError::SwitchFailed {
            target,
            reason: SwitchFailure::DeviceLost { session, .. },
        } => {
            assert_eq!(target, a);
            assert_eq!(session, a);
        }
        other => panic!("expected device loss, got {other:?}"),
    }
    assert_eq!(m.active_session(), Some(b));
    assert_eq!(m.session_state(b).unwrap(), SessionState::Active);
    assert_ne!(m.session_state(a).unwrap(), SessionState::Active);

    assert_eq!(m.switch_to(a).unwrap(), a);
}
