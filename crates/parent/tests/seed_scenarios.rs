//! Integration tests for the parent-protocol seed scenarios from spec.md
//! §8 (1-4): permission denial, matched OPEN/REGISTER, OPEN-before-REGISTER
//! with a wakeup, and dead-service reclamation.

use std::sync::Arc;

use kernel_iface::{CountingSemaphore, MockKernel, Semaphore};
use parent::dispatch::Parent;
use parent::wire::ProtoError;

fn new_parent() -> (Parent<MockKernel>, Arc<MockKernel>) {
    let kernel = Arc::new(MockKernel::new());
    (Parent::new(kernel.clone(), 0x1000, 16, 1_000_000, 1_000_000), kernel)
}

fn wake() -> Arc<dyn Semaphore> {
    Arc::new(CountingSemaphore::new())
}

#[test]
fn scenario1_open_without_permission_is_denied() {
    let (parent, _kernel) = new_parent();
    let result = parent.open(1, "quota::guid", 0, 0, "timer", wake());
    assert_eq!(result, Err(ProtoError::Perm));
    assert!(parent.sessions.is_empty());
}

#[test]
fn scenario2_open_with_permission_then_get_portal_is_idempotent() {
    let (parent, kernel) = new_parent();

    let service_identity = parent
        .register("namespace::/s0/", 0, "timer", 0xcafe)
        .expect("register should succeed");
    kernel.birth(service_identity);
    kernel.birth(0xcafe); // the portal cap itself must resolve

    let session1 = parent
        .open(42, "name::/s0/timer", 0, 0, "timer", wake())
        .expect("open should be permitted");
    let portal = parent.get_portal(session1).expect("portal should resolve");
    assert_eq!(portal, 0xcafe);

    // A second OPEN from the same client/name returns the same identity cap.
    let session2 = parent
        .open(42, "name::/s0/timer", 0, 0, "timer", wake())
        .expect("second open should also be permitted");
    assert_eq!(session1, session2);
}

#[test]
fn scenario3_open_before_register_retries_then_resolves_after_register() {
    let (parent, kernel) = new_parent();

    let session = parent
        .open(7, "name::/s0/timer", 0, 0, "timer", wake())
        .expect("open should be permitted even with no provider yet");
    assert_eq!(parent.get_portal(session), Err(ProtoError::Retry));

    let service_identity = parent
        .register("namespace::/s0/", 0, "timer", 0xbeef)
        .expect("register should succeed");
    kernel.birth(service_identity);
    kernel.birth(0xbeef);

    let portal = parent.get_portal(session).expect("portal now resolves");
    assert_eq!(portal, 0xbeef);
}

#[test]
fn scenario4_dead_service_is_reclaimed_and_a_fresh_provider_succeeds() {
    let (parent, kernel) = new_parent();

    let dead_service = parent
        .register("namespace::/s0/", 0, "disk", 0xdead)
        .expect("register should succeed");
    kernel.birth(dead_service);
    // The portal cap itself never resolved (or has since died).

    let session = parent
        .open(3, "name::/s0/disk", 0, 0, "disk", wake())
        .expect("open should be permitted");
    assert_eq!(parent.get_portal(session), Err(ProtoError::Retry));
    assert!(parent.services.get_client_data(dead_service).is_err(), "stale service entry must be swept");

    let fresh_service = parent
        .register("namespace::/s0/", 0, "disk", 0xf00d)
        .expect("a fresh provider can register the same name");
    kernel.birth(fresh_service);
    kernel.birth(0xf00d);

    let portal = parent.get_portal(session).expect("portal resolves against the fresh provider");
    assert_eq!(portal, 0xf00d);
}

#[test]
fn get_quota_guid_is_gated_on_the_token_and_returns_the_session_pseudonym() {
    let (parent, kernel) = new_parent();
    let service_identity = parent.register("namespace::/s0/", 0, "timer", 0xaaa).unwrap();
    kernel.birth(service_identity);
    kernel.birth(0xaaa);

    let session = parent.open(99, "name::/s0/timer quota::guid", 0, 0, "timer", wake()).unwrap();
    assert_eq!(parent.get_quota(session, "name::/s0/timer quota::guid", "guid", 0), Ok(99));
    assert_eq!(
        parent.get_quota(session, "name::/s0/timer", "guid", 0),
        Err(ProtoError::Perm)
    );
    assert!(parent.get_quota(session, "", "mem", 0).is_ok());
}
