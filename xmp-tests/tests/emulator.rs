use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use xmp_client::{
    Builder, Credentials, Error, IndexChange, IndexEvent, RetryPolicy, Tester,
};
use xmp_protocol::{
    Address, Command, Status,
    commands::{
        OnOff, ReservationStatus, Toggle,
        indexed::{HISTOGRAMS, HistogramRange, STREAMS},
        port::{P_SPEED, P_TRAFFIC},
    },
};
use xmp_server::EmulatorConfig;
use xmp_tests::{Lab, PATIENCE, PASSWORD, quiet_config};

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(PATIENCE, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting until {what}");
}

/// A request/reply pair on `tester`'s connection. Everything the emulator
/// pushed to it before has been dispatched once this returns.
async fn round_trip(tester: &Tester) {
    tester.keepalive().get().await.unwrap();
}

#[tokio::test]
async fn stream_lifecycle() {
    let lab = Lab::start(EmulatorConfig::default()).await;
    let alice = lab.tester("alice").await;
    let port = alice.port(0, 0);
    port.reservation().reserve().await.unwrap();

    let first = port.streams.create().await.unwrap();
    let second = port.streams.create().await.unwrap();
    assert_eq!(first.index(), 0);
    assert_eq!(second.index(), 1);
    assert_eq!(second.address(), &Address::port(0, 0).with_index(1));

    second.enable().set_on().await.unwrap();
    assert_eq!(second.enable().get().await.unwrap().state, OnOff::On);

    port.streams.remove(0).await.unwrap();
    port.streams.server_sync().await.unwrap();
    assert_eq!(port.streams.indices(), vec![1]);
    assert_eq!(lab.emulator.indices(&STREAMS, 0, 0), vec![1]);

    // Index 0 is free again.
    assert_eq!(port.streams.create().await.unwrap().index(), 0);
}

#[tokio::test]
async fn sync_reconciles_with_remote_changes() {
    let lab = Lab::start(EmulatorConfig::default()).await;
    let alice = lab.tester("alice").await;
    let port = alice.port(0, 1);
    port.reservation().reserve().await.unwrap();
    for _ in 0..4 {
        port.streams.create().await.unwrap();
    }
    port.streams.remove(0).await.unwrap();
    port.streams.remove(2).await.unwrap();
    assert_eq!(port.streams.indices(), vec![1, 3]);

    let mut changes = port.streams.subscribe();
    lab.emulator.remove_index(&STREAMS, 0, 1, 1);
    lab.emulator.insert_index(&STREAMS, 0, 1, 2);
    port.streams.server_sync().await.unwrap();

    assert_eq!(port.streams.indices(), vec![2, 3]);
    let mut seen = vec![changes.try_recv().unwrap(), changes.try_recv().unwrap()];
    seen.sort_by_key(|event| event.index);
    assert_eq!(
        seen,
        vec![
            IndexEvent {
                kind: "stream",
                index: 1,
                change: IndexChange::Removed,
            },
            IndexEvent {
                kind: "stream",
                index: 2,
                change: IndexChange::Added,
            },
        ]
    );
    assert!(changes.try_recv().is_err());
}

#[tokio::test]
async fn stale_cache_create_is_rejected() {
    let lab = Lab::start(EmulatorConfig::default()).await;
    let alice = lab.tester("alice").await;
    let port = alice.port(1, 0);
    port.reservation().reserve().await.unwrap();
    lab.emulator.insert_index(&STREAMS, 1, 0, 0);

    match port.streams.create().await {
        Err(Error::ResourceCreation {
            kind,
            index,
            address,
            status,
        }) => {
            assert_eq!(kind, "stream");
            assert_eq!(index, 0);
            assert_eq!(address, Address::port(1, 0));
            assert_eq!(status, Status::NotValid);
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert!(port.streams.is_empty());

    port.streams.server_sync().await.unwrap();
    assert_eq!(port.streams.create().await.unwrap().index(), 1);
}

#[tokio::test]
async fn histogram_capacity_is_enforced() {
    let lab = Lab::start(EmulatorConfig::default()).await;
    let alice = lab.tester("alice").await;
    let port = alice.port(0, 2);
    port.reservation().reserve().await.unwrap();

    let histogram = port.histograms.create().await.unwrap();
    let range = HistogramRange {
        start: -100,
        step: 10,
        bucket_count: 20,
    };
    histogram.range().set(range.clone()).await.unwrap();
    assert_eq!(histogram.range().get().await.unwrap(), range);
    port.histograms.create().await.unwrap();

    let full = port.histograms.create().await;
    match full {
        Err(Error::ResourceCreation { index, status, .. }) => {
            assert_eq!(index, 2);
            assert_eq!(status, Status::CapacityExceeded);
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(lab.emulator.indices(&HISTOGRAMS, 0, 2), vec![0, 1]);
}

#[tokio::test]
async fn deleting_unknown_index_is_a_lifecycle_error() {
    let lab = Lab::start(EmulatorConfig::default()).await;
    let alice = lab.tester("alice").await;
    let port = alice.port(0, 0);
    port.reservation().reserve().await.unwrap();

    let ghost = port.filters.obtain(4);
    match ghost.delete().await {
        Err(Error::ResourceLifecycle { kind, index, status, .. }) => {
            assert_eq!(kind, "filter");
            assert_eq!(index, 4);
            assert_eq!(status, Status::BadIndex);
        }
        other => panic!("unexpected result {other:?}"),
    }
}

#[tokio::test]
async fn index_events_follow_the_cache() {
    let lab = Lab::start(EmulatorConfig::default()).await;
    let alice = lab.tester("alice").await;
    let port = alice.port(1, 3);
    port.reservation().reserve().await.unwrap();
    let mut changes = port.match_terms.subscribe();

    let term = port.match_terms.create().await.unwrap();
    let added = changes.recv().await.unwrap();
    assert_eq!(added.index, term.index());
    assert_eq!(added.change, IndexChange::Added);

    term.delete().await.unwrap();
    let removed = changes.recv().await.unwrap();
    assert_eq!(removed.change, IndexChange::Removed);
    assert!(port.match_terms.is_empty());
}

#[tokio::test]
async fn mutation_requires_reservation() {
    let lab = Lab::start(EmulatorConfig::default()).await;
    let alice = lab.tester("alice").await;
    let port = alice.port(0, 0);

    let refused = port.traffic().set_on().await;
    assert!(
        matches!(
            refused,
            Err(Error::Status {
                status: Status::NotReserved,
                ..
            })
        ),
        "{refused:?}"
    );
    let refused = port.streams.create().await;
    assert_eq!(
        refused.err().and_then(|e| e.status()),
        Some(Status::NotReserved)
    );

    // Reading needs no reservation.
    assert_eq!(port.speed().get().await.unwrap().mbps, 10_000);
}

#[tokio::test]
async fn reserve_regardless_takes_over() {
    let lab = Lab::start(EmulatorConfig::default()).await;
    let alice = lab.tester("alice").await;
    let bob = lab.tester("bob").await;
    let port = Address::port(0, 3);

    bob.port(0, 3).reservation().reserve().await.unwrap();
    assert_eq!(lab.emulator.reserved_by(&port).as_deref(), Some("bob"));

    let mine = alice.port(0, 3);
    let reservation = mine.reservation();
    assert_eq!(
        reservation.refresh().await.unwrap(),
        ReservationStatus::ReservedByOther
    );
    reservation.reserve_regardless().await.unwrap();
    assert_eq!(reservation.state(), ReservationStatus::ReservedByYou);
    assert_eq!(lab.emulator.reserved_by(&port).as_deref(), Some("alice"));
    assert_eq!(reservation.reserved_by().await.unwrap(), "alice");

    // Already ours: nothing is sent that the tester would reject.
    reservation.reserve_regardless().await.unwrap();
    assert_eq!(lab.emulator.reserved_by(&port).as_deref(), Some("alice"));

    // Reserving again explicitly is refused.
    assert_eq!(
        reservation.reserve().await.err().and_then(|e| e.status()),
        Some(Status::NotValid)
    );
}

#[tokio::test]
async fn reservation_pushes_update_other_sessions() {
    let lab = Lab::start(EmulatorConfig::default()).await;
    let alice = lab.tester("alice").await;
    let bob = lab.tester("bob").await;
    let watched = bob.port(1, 1);
    assert_eq!(watched.reservation().state(), ReservationStatus::Released);

    alice.port(1, 1).reservation().reserve().await.unwrap();
    round_trip(&bob).await;
    assert_eq!(
        watched.reservation().state(),
        ReservationStatus::ReservedByOther
    );

    alice.port(1, 1).reservation().release().await.unwrap();
    round_trip(&bob).await;
    assert_eq!(watched.reservation().state(), ReservationStatus::Released);
}

#[tokio::test]
async fn reservations_are_released_when_the_holder_leaves() {
    let lab = Lab::start(EmulatorConfig::default()).await;
    let alice = lab.tester("alice").await;
    let bob = lab.tester("bob").await;
    let watched = bob.port(0, 1);

    alice.module(0).reservation().reserve().await.unwrap();
    alice.port(0, 1).reservation().reserve().await.unwrap();
    round_trip(&bob).await;
    assert_eq!(
        watched.reservation().state(),
        ReservationStatus::ReservedByOther
    );

    alice.close().await;
    eventually("alice's reservations are gone", || {
        lab.emulator.reserved_by(&Address::port(0, 1)).is_none()
            && lab.emulator.reserved_by(&Address::module(0)).is_none()
    })
    .await;
    round_trip(&bob).await;
    assert_eq!(watched.reservation().state(), ReservationStatus::Released);
}

#[tokio::test]
async fn traffic_changes_are_pushed_to_other_sessions() {
    let lab = Lab::start(EmulatorConfig::default()).await;
    let alice = lab.tester("alice").await;
    let bob = lab.tester("bob").await;
    let mut traffic = bob.connection().events(P_TRAFFIC::CODE);

    let port = alice.port(1, 2);
    port.reservation().reserve().await.unwrap();
    port.traffic()
        .set(Toggle { state: OnOff::On })
        .await
        .unwrap();

    let event = tokio::time::timeout(PATIENCE, traffic.recv())
        .await
        .unwrap()
        .expect("traffic push");
    assert_eq!(event.address, Address::port(1, 2));
    assert_eq!(&event.payload[..], &[1]);
    assert_eq!(bob.port(1, 2).traffic().get().await.unwrap().state, OnOff::On);
}

#[tokio::test]
async fn speed_changes_are_pushed_typed() {
    let lab = Lab::start(EmulatorConfig::default()).await;
    let alice = lab.tester("alice").await;
    let (changes, mut received) = mpsc::unbounded_channel();
    let _speed = alice.connection().on::<P_SPEED>(move |address, speed| {
        let _ = changes.send((address.clone(), speed.mbps));
        Ok(())
    });

    lab.emulator.set_speed(1, 0, 25_000);
    let (address, mbps) = tokio::time::timeout(PATIENCE, received.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(address, Address::port(1, 0));
    assert_eq!(mbps, 25_000);
    assert_eq!(alice.port(1, 0).speed().get().await.unwrap().mbps, 25_000);
}

#[tokio::test]
async fn cdb_is_polled_until_done() {
    let lab = Lab::start(EmulatorConfig {
        cdb_pending_polls: 3,
        ..Default::default()
    })
    .await;
    let alice = lab.tester("alice").await;
    let port = alice.port(0, 0);
    port.reservation().reserve().await.unwrap();

    let policy = RetryPolicy {
        interval: Duration::from_millis(5),
        max_attempts: 10,
    };
    let instruction = json!({ "cmd": "firmware_version" });
    let reply = port.run_cdb(instruction.clone(), &policy).await.unwrap();
    assert_eq!(reply["status"], "done");
    assert_eq!(reply["command"], instruction);
}

#[tokio::test]
async fn cdb_gives_up_after_max_attempts() {
    let lab = Lab::start(EmulatorConfig {
        cdb_pending_polls: 100,
        ..Default::default()
    })
    .await;
    let alice = lab.tester("alice").await;
    let port = alice.port(0, 0);
    port.reservation().reserve().await.unwrap();

    let policy = RetryPolicy {
        interval: Duration::from_millis(1),
        max_attempts: 3,
    };
    let busy = port.run_cdb(json!({}), &policy).await.unwrap_err();
    assert!(busy.is_retryable(), "{busy:?}");
}

#[tokio::test]
async fn keepalives_reach_the_tester() {
    let lab = Lab::start(EmulatorConfig::default()).await;
    let config = Builder::new()
        .keepalive(Some(Duration::from_millis(20)))
        .build();
    let _alice = lab.tester_with("alice", config).await;

    eventually("two keepalives arrived", || lab.emulator.keepalives() >= 2).await;
}

#[tokio::test]
async fn silent_tester_then_disconnect_fails_pending() {
    let lab = Lab::start(EmulatorConfig::default()).await;
    let alice = lab.tester("alice").await;
    assert_eq!(lab.emulator.sessions(), 1);

    lab.emulator.mute(true);
    let speed = alice.port(0, 0).speed().send_get().await.unwrap();
    eventually("the request is pending", || alice.connection().pending() == 1).await;
    lab.emulator.disconnect_all();

    let result = tokio::time::timeout(PATIENCE, speed).await.unwrap();
    assert!(matches!(result, Err(Error::ConnectionClosed)), "{result:?}");
    eventually("the session is gone", || lab.emulator.sessions() == 0).await;
    assert!(!alice.connection().is_connected());
}

#[tokio::test]
async fn wrong_password_is_refused() {
    let lab = Lab::start(EmulatorConfig::default()).await;
    let refused = Tester::connect(
        lab.addr,
        Credentials::new("mallory", "guess"),
        quiet_config(),
    )
    .await;
    match refused {
        Err(error) => assert_eq!(error.status(), Some(Status::NotValid)),
        Ok(_) => panic!("logged on with a wrong password"),
    }

    let alice = Tester::connect(lab.addr, Credentials::new("alice", PASSWORD), quiet_config())
        .await
        .unwrap();
    assert_eq!(alice.username(), "alice");
}
