//! End-to-end traffic tests against mock cluster peers, covering the
//! session life-cycle, queue rewriting and counter reconciliation.

use lorawan_payload::DevAddr;

use crate::message::{
    ApplicationDownlink, ApplicationInvalidatedDownlinks, ApplicationJoinAccept,
    ApplicationLocation, ApplicationUp, DeviceIds, DownlinkQueueRequest, Up,
};
use crate::session::EndDevice;
use crate::test_util::wrapped_key;

mod util;
use util::*;


#[tokio::test]
async fn join_accept_fetches_the_session_key_from_the_join_server() {
    let h = setup().await;
    h.js.add(dev_eui(), &[0x11], wrapped_key([0x11; 16]));
    let mut sub = h.subscribe().await;

    h.ns.send_up(ApplicationUp {
        ids: device_ids().with_dev_addr(DevAddr::from(0x11111111)),
        correlation_ids: vec![],
        up: Up::JoinAccept(ApplicationJoinAccept {
            session_key_id: vec![0x11],
            ..Default::default()
        }),
    })
    .await;

    let up = recv_up(&mut sub).await;
    match up.up {
        Up::JoinAccept(join) => {
            assert_eq!(join.session_key_id, vec![0x11]);
            assert!(join.app_s_key.is_none(), "AppSKey must not reach subscribers");
            assert!(join.invalidated_downlinks.is_empty());
            assert!(!join.pending_session);
        }
        other => panic!("unexpected upstream event {other:?}"),
    }

    let dev = h.device(&device_ids()).await;
    let session = dev.session.expect("current session");
    assert_eq!(session.session_key_id, vec![0x11]);
    assert_eq!(session.dev_addr, DevAddr::from(0x11111111));
    assert_eq!(session.last_a_f_cnt_down, 0);
    assert!(session.app_s_key.is_wrapped(), "key stays wrapped at rest");
    assert!(dev.pending_session.is_none());
    assert_eq!(dev.ids.dev_addr, Some(DevAddr::from(0x11111111)));
    assert!(h.ns.queue(&device_ids()).is_empty());
}

#[tokio::test]
async fn join_accept_rewrites_invalidated_downlinks_onto_the_new_session() {
    let h = setup().await;
    h.put_device(EndDevice {
        session: Some(session(0x22)),
        ..EndDevice::new(device_ids())
    })
    .await;
    let mut sub = h.subscribe().await;

    h.ns.send_up(ApplicationUp {
        ids: device_ids().with_dev_addr(DevAddr::from(0x33333333)),
        correlation_ids: vec![],
        up: Up::JoinAccept(ApplicationJoinAccept {
            session_key_id: vec![0x33],
            app_s_key: Some(wrapped_key([0x33; 16])),
            invalidated_downlinks: vec![
                encrypted_downlink(0x22, 11, 11, &[0x01, 0x01, 0x01, 0x01]),
                encrypted_downlink(0x22, 22, 22, &[0x02, 0x02, 0x02, 0x02]),
            ],
            pending_session: false,
        }),
    })
    .await;

    let up = recv_up(&mut sub).await;
    match up.up {
        Up::JoinAccept(join) => {
            assert!(join.app_s_key.is_none());
            assert!(join.invalidated_downlinks.is_empty());
        }
        other => panic!("unexpected upstream event {other:?}"),
    }

    let dev = h.device(&device_ids()).await;
    let session = dev.session.expect("current session");
    assert_eq!(session.session_key_id, vec![0x33]);
    assert_eq!(session.last_a_f_cnt_down, 2);

    let queue = h.ns.queue(&device_ids());
    assert_eq!(queue.len(), 2);
    assert_eq!(queue[0].session_key_id, vec![0x33]);
    assert_eq!((queue[0].f_port, queue[0].f_cnt), (11, 1));
    assert_eq!(decrypted(0x33, &queue[0]), vec![0x01, 0x01, 0x01, 0x01]);
    assert_eq!(queue[1].session_key_id, vec![0x33]);
    assert_eq!((queue[1].f_port, queue[1].f_cnt), (22, 2));
    assert_eq!(decrypted(0x33, &queue[1]), vec![0x02, 0x02, 0x02, 0x02]);
}

#[tokio::test]
async fn pending_join_accept_leaves_the_current_session_in_place() {
    let h = setup().await;
    let mut current = session(0x33);
    current.last_a_f_cnt_down = 2;
    h.put_device(EndDevice { session: Some(current), ..EndDevice::new(device_ids()) }).await;
    h.ns.set_queue(
        &device_ids(),
        vec![
            encrypted_downlink(0x33, 11, 1, &[0x01, 0x01, 0x01, 0x01]),
            encrypted_downlink(0x33, 22, 2, &[0x02, 0x02, 0x02, 0x02]),
        ],
    );
    let mut sub = h.subscribe().await;

    h.ns.send_up(ApplicationUp {
        ids: device_ids().with_dev_addr(DevAddr::from(0x44444444)),
        correlation_ids: vec![],
        up: Up::JoinAccept(ApplicationJoinAccept {
            session_key_id: vec![0x44],
            app_s_key: Some(wrapped_key([0x44; 16])),
            pending_session: true,
            ..Default::default()
        }),
    })
    .await;

    let up = recv_up(&mut sub).await;
    match up.up {
        Up::JoinAccept(join) => {
            assert!(join.pending_session);
            assert!(join.app_s_key.is_none());
        }
        other => panic!("unexpected upstream event {other:?}"),
    }

    let dev = h.device(&device_ids()).await;
    assert_eq!(dev.session.as_ref().unwrap().session_key_id, vec![0x33]);
    assert_eq!(dev.session.as_ref().unwrap().last_a_f_cnt_down, 2);
    assert_eq!(dev.pending_session.as_ref().unwrap().session_key_id, vec![0x44]);
    assert_eq!(dev.pending_session.as_ref().unwrap().last_a_f_cnt_down, 0);
    // the queue still belongs to the old session
    let queue = h.ns.queue(&device_ids());
    assert_eq!(queue.len(), 2);
    assert_eq!(queue[0].session_key_id, vec![0x33]);
}

#[tokio::test]
async fn uplink_on_the_pending_session_promotes_it_and_rewrites_the_queue() {
    let h = setup().await;
    let mut current = session(0x33);
    current.last_a_f_cnt_down = 2;
    let pending = session(0x44);
    let pending_started = pending.started_at;
    h.put_device(EndDevice {
        session: Some(current),
        pending_session: Some(pending),
        ..EndDevice::new(device_ids())
    })
    .await;
    h.ns.set_queue(
        &device_ids(),
        vec![
            encrypted_downlink(0x33, 11, 1, &[0x01, 0x01, 0x01, 0x01]),
            encrypted_downlink(0x33, 22, 2, &[0x02, 0x02, 0x02, 0x02]),
        ],
    );
    let mut sub = h.subscribe().await;

    // FRMPayload bytes produced by the peer stack for plaintext
    // 0x646464 under the 0x44 session at FCnt 24
    h.send_uplink(
        DevAddr::from(0x44444444),
        crate::message::ApplicationUplink {
            session_key_id: vec![0x44],
            f_port: 24,
            f_cnt: 24,
            frm_payload: hex::decode("144e3c").unwrap(),
            ..Default::default()
        },
    )
    .await;

    let up = recv_up(&mut sub).await;
    match up.up {
        Up::UplinkMessage(uplink) => {
            assert_eq!(uplink.frm_payload, vec![0x64, 0x64, 0x64]);
            assert_eq!(uplink.decoded_payload.unwrap()["sum"], 300);
        }
        other => panic!("unexpected upstream event {other:?}"),
    }

    let dev = h.device(&device_ids()).await;
    let session = dev.session.expect("current session");
    assert_eq!(session.session_key_id, vec![0x44]);
    assert_eq!(session.last_a_f_cnt_down, 2);
    assert_eq!(session.started_at, pending_started, "promotion keeps the join-accept time");
    assert!(dev.pending_session.is_none());
    assert_eq!(dev.ids.dev_addr, Some(DevAddr::from(0x44444444)));

    let queue = h.ns.queue(&device_ids());
    assert_eq!(queue.len(), 2);
    assert_eq!(queue[0].session_key_id, vec![0x44]);
    assert_eq!((queue[0].f_port, queue[0].f_cnt), (11, 1));
    assert_eq!(decrypted(0x44, &queue[0]), vec![0x01, 0x01, 0x01, 0x01]);
    assert_eq!((queue[1].f_port, queue[1].f_cnt), (22, 2));
    assert_eq!(decrypted(0x44, &queue[1]), vec![0x02, 0x02, 0x02, 0x02]);
}

#[tokio::test]
async fn nacked_downlink_is_requeued_at_the_head() {
    let h = setup().await;
    let mut current = session(0x33);
    current.last_a_f_cnt_down = 2;
    h.put_device(EndDevice { session: Some(current), ..EndDevice::new(device_ids()) }).await;
    // the NS dropped the nacked item; only the second one remains
    h.ns.set_queue(
        &device_ids(),
        vec![encrypted_downlink(0x33, 22, 2, &[0x02, 0x02, 0x02, 0x02])],
    );
    let mut sub = h.subscribe().await;

    h.ns.send_up(ApplicationUp {
        ids: device_ids().with_dev_addr(DevAddr::from(0x33333333)),
        correlation_ids: vec![],
        up: Up::DownlinkNack(encrypted_downlink(0x33, 11, 1, &[0x01, 0x01, 0x01, 0x01])),
    })
    .await;

    let up = recv_up(&mut sub).await;
    match up.up {
        Up::DownlinkNack(item) => {
            assert_eq!(item.f_cnt, 1);
            assert_eq!(item.frm_payload, vec![0x01, 0x01, 0x01, 0x01]);
        }
        other => panic!("unexpected upstream event {other:?}"),
    }

    let queue = h.ns.queue(&device_ids());
    assert_eq!(queue.len(), 2);
    assert_eq!((queue[0].f_port, queue[0].f_cnt), (11, 1));
    assert_eq!(decrypted(0x33, &queue[0]), vec![0x01, 0x01, 0x01, 0x01]);
    assert_eq!((queue[1].f_port, queue[1].f_cnt), (22, 2));
    assert_eq!(decrypted(0x33, &queue[1]), vec![0x02, 0x02, 0x02, 0x02]);
}

#[tokio::test]
async fn queue_invalidation_reconciles_counters_with_the_network_server() {
    let h = setup().await;
    let mut current = session(0x44);
    current.last_a_f_cnt_down = 2;
    h.put_device(EndDevice { session: Some(current), ..EndDevice::new(device_ids()) }).await;
    let mut sub = h.subscribe().await;

    h.ns.send_up(ApplicationUp {
        ids: device_ids().with_dev_addr(DevAddr::from(0x44444444)),
        correlation_ids: vec![],
        up: Up::DownlinkQueueInvalidated(ApplicationInvalidatedDownlinks {
            downlinks: vec![
                encrypted_downlink(0x44, 11, 11, &[0x01, 0x01, 0x01, 0x01]),
                ApplicationDownlink {
                    session_key_id: vec![0x11, 0x22, 0x33, 0x44],
                    f_port: 12,
                    f_cnt: 12,
                    frm_payload: vec![0xff, 0xff, 0xff, 0xff],
                    ..Default::default()
                },
                encrypted_downlink(0x44, 22, 22, &[0x02, 0x02, 0x02, 0x02]),
            ],
            last_f_cnt_down: 42,
        }),
    })
    .await;

    wait_until(|| async {
        h.device(&device_ids()).await.session.unwrap().last_a_f_cnt_down == 44
    })
    .await;
    // queue invalidation produces no upstream event
    expect_no_up(&mut sub).await;

    let dev = h.device(&device_ids()).await;
    assert_eq!(dev.session.as_ref().unwrap().last_a_f_cnt_down, 44);

    let queue = h.ns.queue(&device_ids());
    assert_eq!(queue.len(), 2, "the foreign-session item is dropped");
    assert_eq!((queue[0].f_port, queue[0].f_cnt), (11, 43));
    assert_eq!(decrypted(0x44, &queue[0]), vec![0x01, 0x01, 0x01, 0x01]);
    assert_eq!((queue[1].f_port, queue[1].f_cnt), (22, 44));
    assert_eq!(decrypted(0x44, &queue[1]), vec![0x02, 0x02, 0x02, 0x02]);
}

#[tokio::test]
async fn uplink_with_an_unknown_session_key_is_dropped() {
    let h = setup().await;
    h.put_device(EndDevice { session: Some(session(0x33)), ..EndDevice::new(device_ids()) })
        .await;
    let mut sub = h.subscribe().await;

    h.send_uplink(DevAddr::from(0x55555555), encrypted_uplink(0x55, 42, 42, &[0x2a, 0x2a, 0x2a]))
        .await;

    expect_no_up(&mut sub).await;
    let dev = h.device(&device_ids()).await;
    assert_eq!(dev.session.as_ref().unwrap().session_key_id, vec![0x33]);
}

#[tokio::test]
async fn join_accept_for_the_current_session_is_a_no_op() {
    let h = setup().await;
    let mut current = session(0x33);
    current.last_a_f_cnt_down = 5;
    let started = current.started_at;
    h.put_device(EndDevice { session: Some(current), ..EndDevice::new(device_ids()) }).await;
    let mut sub = h.subscribe().await;

    h.ns.send_up(ApplicationUp {
        ids: device_ids().with_dev_addr(DevAddr::from(0x33333333)),
        correlation_ids: vec![],
        up: Up::JoinAccept(ApplicationJoinAccept {
            session_key_id: vec![0x33],
            app_s_key: Some(wrapped_key([0x33; 16])),
            ..Default::default()
        }),
    })
    .await;

    let up = recv_up(&mut sub).await;
    assert!(matches!(up.up, Up::JoinAccept(ref join) if join.app_s_key.is_none()));

    let dev = h.device(&device_ids()).await;
    let session = dev.session.expect("current session");
    assert_eq!(session.last_a_f_cnt_down, 5, "counters survive a replayed join-accept");
    assert_eq!(session.started_at, started);
    assert!(dev.pending_session.is_none());
}

#[tokio::test]
async fn messages_for_unregistered_devices_are_dropped() {
    let h = setup().await;
    let mut sub = h.subscribe().await;

    let ghost = DeviceIds::new(APP, "ghost").with_dev_addr(DevAddr::from(0x55555555));
    h.ns.send_up(ApplicationUp {
        ids: ghost,
        correlation_ids: vec![],
        up: Up::UplinkMessage(encrypted_uplink(0x55, 11, 11, &[0x01])),
    })
    .await;

    expect_no_up(&mut sub).await;
}

#[tokio::test]
async fn location_solved_passes_through() {
    let h = setup().await;
    h.put_device(EndDevice { session: Some(session(0x33)), ..EndDevice::new(device_ids()) })
        .await;
    let mut sub = h.subscribe().await;

    let location = ApplicationLocation {
        latitude: 52.37,
        longitude: 4.88,
        altitude: 2,
        source: "geolocation".to_owned(),
    };
    h.ns.send_up(ApplicationUp {
        ids: device_ids(),
        correlation_ids: vec!["ns:up:1".to_owned()],
        up: Up::LocationSolved(location.clone()),
    })
    .await;

    let up = recv_up(&mut sub).await;
    assert_eq!(up.correlation_ids, vec!["ns:up:1".to_owned()]);
    assert_eq!(up.up, Up::LocationSolved(location));
}

#[tokio::test]
async fn downlink_queued_echo_carries_the_plaintext() {
    let h = setup().await;
    h.put_device(EndDevice { session: Some(session(0x33)), ..EndDevice::new(device_ids()) })
        .await;
    let mut sub = h.subscribe().await;

    h.ns.send_up(ApplicationUp {
        ids: device_ids().with_dev_addr(DevAddr::from(0x33333333)),
        correlation_ids: vec![],
        up: Up::DownlinkQueued(encrypted_downlink(0x33, 42, 42, &[0x01, 0x01, 0x01, 0x01])),
    })
    .await;

    let up = recv_up(&mut sub).await;
    match up.up {
        Up::DownlinkQueued(item) => {
            assert_eq!(item.frm_payload, vec![0x01, 0x01, 0x01, 0x01]);
            assert_eq!(item.f_cnt, 42);
            // the downlink decode formatter annotates the echo
            assert_eq!(item.decoded_payload.unwrap()["sum"], 4);
        }
        other => panic!("unexpected upstream event {other:?}"),
    }
}

#[tokio::test]
async fn a_newer_pending_join_accept_supersedes_the_previous_one() {
    let h = setup().await;
    h.put_device(EndDevice {
        session: Some(session(0x33)),
        pending_session: Some(session(0x44)),
        ..EndDevice::new(device_ids())
    })
    .await;
    let mut sub = h.subscribe().await;

    h.ns.send_up(ApplicationUp {
        ids: device_ids().with_dev_addr(DevAddr::from(0x55555555)),
        correlation_ids: vec![],
        up: Up::JoinAccept(ApplicationJoinAccept {
            session_key_id: vec![0x55],
            app_s_key: Some(wrapped_key([0x55; 16])),
            pending_session: true,
            ..Default::default()
        }),
    })
    .await;

    recv_up(&mut sub).await;
    let dev = h.device(&device_ids()).await;
    assert_eq!(dev.session.as_ref().unwrap().session_key_id, vec![0x33]);
    assert_eq!(dev.pending_session.as_ref().unwrap().session_key_id, vec![0x55]);
}

#[tokio::test]
async fn session_key_unknown_at_the_join_server_drops_the_join() {
    let h = setup().await;
    // no key registered in the JS for 0x66
    let mut sub = h.subscribe().await;

    h.ns.send_up(ApplicationUp {
        ids: device_ids().with_dev_addr(DevAddr::from(0x66666666)),
        correlation_ids: vec![],
        up: Up::JoinAccept(ApplicationJoinAccept {
            session_key_id: vec![0x66],
            ..Default::default()
        }),
    })
    .await;

    expect_no_up(&mut sub).await;
    let dev = h.device(&device_ids()).await;
    assert!(dev.session.is_none());
    assert!(dev.pending_session.is_none());
}

#[tokio::test]
async fn downlink_queue_push_is_rejected_for_unregistered_devices() {
    let h = setup().await;
    let err = h
        .server
        .downlink_queue_push(DownlinkQueueRequest {
            ids: DeviceIds::new(APP, "ghost"),
            downlinks: vec![ApplicationDownlink {
                f_port: 11,
                frm_payload: vec![0x01, 0x01, 0x01],
                ..Default::default()
            }],
        })
        .await
        .unwrap_err();
    assert_eq!(err.name(), "not_found");
    assert_eq!(h.ns.push_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(h.ns.replace_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn sessions_remain_consistent_under_invariants() {
    // the standing invariants: one current, one pending, different ids
    let h = setup().await;
    h.put_device(EndDevice {
        session: Some(session(0x33)),
        pending_session: Some(session(0x44)),
        ..EndDevice::new(device_ids())
    })
    .await;
    let dev = h.device(&device_ids()).await;
    let (current, pending) = (dev.session.unwrap(), dev.pending_session.unwrap());
    assert_ne!(current.session_key_id, pending.session_key_id);

    // a promoted session never resurrects the discarded one
    let mut sub = h.subscribe().await;
    h.send_uplink(DevAddr::from(0x44444444), encrypted_uplink(0x44, 1, 1, &[0x01])).await;
    recv_up(&mut sub).await;
    let dev = h.device(&device_ids()).await;
    assert_eq!(dev.session.as_ref().unwrap().session_key_id, vec![0x44]);
    assert!(dev.pending_session.is_none());
}
