use std::net::SocketAddr;

use bytes::Bytes;
use masterproto::master::{parse_req, MasterReq, MasterResp, ServerRole};
use tracing::{debug, info, warn};

use crate::instance::TransferRequest;
use crate::master::Master;
use crate::transport::PeerEvent;

pub fn handle_event(m: &mut Master, ev: PeerEvent) {
    match ev {
        PeerEvent::Frame { peer, payload } => handle_frame(m, peer, payload),
        PeerEvent::Disconnected { peer, clean } => handle_disconnect(m, peer, clean),
    }
}

pub fn handle_frame(m: &mut Master, peer: SocketAddr, payload: Bytes) {
    let req = match parse_req(payload) {
        Ok(req) => req,
        Err(e) => {
            debug!(peer = %peer, err = %e, "ignoring malformed message");
            return;
        }
    };

    match req {
        MasterReq::RequestPersistentId { request_id } => {
            let object_id = m.ids.allocate();
            debug!(request_id, object_id, "persistent id handed out");
            m.outbox.send(
                peer,
                MasterResp::PersistentIdResponse {
                    request_id,
                    object_id,
                }
                .encode(),
            );
        }

        MasterReq::RequestZoneTransfer {
            request_id,
            mythran_shift,
            zone_id,
            clone_id,
        } => {
            let Ok(map_id) = u16::try_from(zone_id) else {
                debug!(zone_id, "zone id out of range");
                return;
            };
            let req = TransferRequest {
                request_id,
                mythran_shift,
                requester: peer,
            };

            let idx = m.im.get_instance(map_id, clone_id);
            if !m.im.get(idx).ready {
                info!(request_id, map_id, clone_id, "instance not ready, parking request");
                m.im.get_mut(idx).enqueue_pending(req);
                return;
            }
            info!(request_id, map_id, clone_id, "starting transfer handshake");
            m.im.request_affirmation(idx, req, &mut m.outbox);
        }

        MasterReq::ServerInfo {
            port,
            zone_id,
            instance_id,
            role,
            ip,
        } => handle_server_info(m, peer, port, zone_id, instance_id, role, ip),

        MasterReq::SetSessionKey {
            session_key,
            username,
        } => {
            let displaced = m.sessions.set(session_key, &username);
            if displaced {
                m.outbox.broadcast(
                    MasterResp::NewSessionAlert {
                        session_key,
                        username: username.clone(),
                    }
                    .encode(),
                );
            }
            info!(
                session_key,
                username = %username,
                displaced,
                active = m.sessions.len(),
                "session registered"
            );
        }

        MasterReq::RequestSessionKey { username } => {
            if let Some(session_key) = m.sessions.find_key(&username) {
                m.outbox.send(
                    peer,
                    MasterResp::SessionKeyResponse {
                        session_key,
                        username,
                    }
                    .encode(),
                );
            }
        }

        MasterReq::PlayerAdded {
            map_id,
            instance_id,
        } => match m.im.find_by_map_and_instance(map_id, instance_id) {
            Some(idx) => m.im.get_mut(idx).add_player(),
            None => warn!(map_id, instance_id, "player added to unknown instance"),
        },

        MasterReq::PlayerRemoved {
            map_id,
            instance_id,
        } => {
            if let Some(idx) = m.im.find_by_map_and_instance(map_id, instance_id) {
                m.im.get_mut(idx).remove_player();
            }
        }

        MasterReq::CreatePrivateZone {
            map_id,
            clone_id,
            password,
        } => {
            let Ok(map_id) = u16::try_from(map_id) else {
                debug!(map_id, "map id out of range");
                return;
            };
            let idx = m.im.create_private(map_id, clone_id, password);
            let zone = m.im.get(idx).zone;
            m.log.line(&format!("private instance {zone} created"));
        }

        MasterReq::RequestPrivateZone {
            request_id,
            mythran_shift,
            password,
        } => {
            let Some(idx) = m.im.find_private(&password) else {
                // The requester times out on its own; nothing to send.
                debug!(request_id, "no private zone for that password");
                return;
            };
            let inst = m.im.get(idx);
            info!(request_id, zone = %inst.zone, "private zone join");
            m.outbox.send(
                peer,
                MasterResp::ZoneTransferResponse {
                    request_id,
                    mythran_shift,
                    map_id: inst.zone.map_id,
                    instance_id: inst.zone.instance_id,
                    clone_id: inst.zone.clone_id,
                    ip: inst.ip.clone(),
                    port: inst.port,
                }
                .encode(),
            );
        }

        MasterReq::WorldReady {
            map_id,
            instance_id,
        } => {
            let Some(idx) = m.im.find_by_map_and_instance(map_id, instance_id) else {
                warn!(map_id, instance_id, "world ready for unknown instance");
                return;
            };
            info!(map_id, instance_id, "world ready");
            m.log
                .line(&format!("instance {} ready", m.im.get(idx).zone));
            m.im.get_mut(idx).sys_addr = Some(peer);
            m.im.ready_instance(idx, &mut m.outbox);
        }

        MasterReq::PrepZone { zone_id } => {
            let Ok(map_id) = u16::try_from(zone_id) else {
                debug!(zone_id, "prep for out-of-range zone");
                return;
            };
            debug!(map_id, "pre-provisioning zone");
            m.im.get_instance(map_id, 0);
        }

        MasterReq::AffirmTransferResponse { request_id } => {
            // Replies from peers we no longer track are expected after
            // reclamation; drop them without ceremony.
            let Some(idx) = m.im.find_by_sys_addr(peer) else {
                return;
            };
            m.im.affirm_transfer(idx, request_id, &mut m.outbox);
        }

        MasterReq::ShutdownResponse => {
            let Some(idx) = m.im.find_by_sys_addr(peer) else {
                return;
            };
            let inst = m.im.get_mut(idx);
            info!(zone = %inst.zone, "instance finished shutting down");
            inst.shutting_down = true;
            inst.shutdown_complete = true;
        }

        MasterReq::ShutdownUniverse => {
            info!("universe shutdown requested, draining in ~10 minutes");
            m.log.line("universe shutdown requested");
            m.universe_shutdown = true;
        }

        MasterReq::ShutdownInstance {
            zone_id,
            instance_id,
        } => {
            let Ok(map_id) = u16::try_from(zone_id) else {
                debug!(zone_id, "shutdown for out-of-range zone");
                return;
            };
            // TODO: gate this on an operator allowlist once peers carry roles.
            match m.im.find_by_map_and_instance(map_id, instance_id) {
                Some(idx) => {
                    info!(map_id, instance_id, "instance shutdown requested");
                    if let Some(addr) = m.im.get(idx).sys_addr {
                        m.outbox.send(addr, MasterResp::Shutdown.encode());
                    }
                }
                None => warn!(map_id, instance_id, "no such instance to shut down"),
            }
        }

        MasterReq::GetInstances {
            object_id,
            zone_id,
            responding_zone_id,
            responding_instance_id,
        } => {
            let target = m
                .im
                .find_by_map_and_instance(responding_zone_id, responding_instance_id)
                .and_then(|idx| m.im.get(idx).sys_addr);
            let Some(target) = target else {
                warn!(
                    responding_zone_id,
                    responding_instance_id, "nowhere to send the instance list"
                );
                return;
            };
            m.outbox.send(
                target,
                MasterResp::RespondInstances {
                    object_id,
                    zones: m.im.zone_list(zone_id),
                }
                .encode(),
            );
        }
    }
}

fn handle_server_info(
    m: &mut Master,
    peer: SocketAddr,
    port: u32,
    zone_id: u32,
    instance_id: u32,
    role: ServerRole,
    ip: String,
) {
    info!(port, zone_id, instance_id, ?role, ip = %ip, "server info");

    let (Ok(port), Ok(map_id), Ok(instance_id)) = (
        u16::try_from(port),
        u16::try_from(zone_id),
        u16::try_from(instance_id),
    ) else {
        debug!("server info fields out of range");
        return;
    };

    if role == ServerRole::World && !m.im.is_port_in_use(port) {
        // A world we have no record of: the master restarted underneath a
        // live fleet and this world found its way back.
        let idx = m.im.adopt_instance(map_id, instance_id, ip, port, peer);
        m.log
            .line(&format!("instance {} adopted", m.im.get(idx).zone));
    } else if let Some(idx) = m.im.find_by_map_and_instance(map_id, instance_id) {
        m.im.get_mut(idx).sys_addr = Some(peer);
    }

    if role == ServerRole::Chat {
        m.chat_peer = Some(peer);
    }
}

pub fn handle_disconnect(m: &mut Master, peer: SocketAddr, clean: bool) {
    if clean {
        info!(peer = %peer, "a server disconnected");
    } else {
        info!(peer = %peer, "a server lost its connection");
    }

    if let Some(idx) = m.im.find_by_sys_addr(peer) {
        let inst = m.im.remove(idx);
        info!(zone = %inst.zone, port = inst.port, "dropped instance record");
        m.log.line(&format!("instance {} dropped", inst.zone));
    }

    if m.chat_peer == Some(peer) {
        m.chat_peer = None;
        if !m.universe_shutdown && !m.shutdown_started {
            warn!("chat relay went away, respawning it");
            m.im.launcher().spawn_chat();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use masterproto::master::parse_resp;

    use crate::transport::Outgoing;

    fn master() -> Master {
        Master::for_tests()
    }

    fn peer(n: u8) -> SocketAddr {
        format!("10.0.0.{n}:5000").parse().unwrap()
    }

    fn sent(m: &mut Master) -> Vec<(Option<SocketAddr>, MasterResp)> {
        m.outbox
            .drain()
            .map(|o| match o {
                Outgoing::To(addr, payload) => (Some(addr), parse_resp(payload).unwrap()),
                Outgoing::Broadcast(payload) => (None, parse_resp(payload).unwrap()),
            })
            .collect()
    }

    #[test]
    fn cold_zone_transfer_end_to_end() {
        let mut m = master();
        let requester = peer(1);
        let world = peer(9);

        // No instances exist: the request spawns one and parks.
        handle_frame(
            &mut m,
            requester,
            MasterReq::RequestZoneTransfer {
                request_id: 7,
                mythran_shift: false,
                zone_id: 1200,
                clone_id: 0,
            }
            .encode(),
        );
        assert_eq!(m.im.instances().len(), 1);
        assert!(!m.im.get(0).ready);
        assert_eq!(m.im.get(0).pending_requests.len(), 1);
        assert!(sent(&mut m).is_empty());

        // The world comes up and reports ready: prep goes out.
        let instance_id = m.im.get(0).zone.instance_id;
        handle_frame(
            &mut m,
            world,
            MasterReq::WorldReady {
                map_id: 1200,
                instance_id,
            }
            .encode(),
        );
        assert_eq!(
            sent(&mut m),
            vec![(Some(world), MasterResp::PrepZone { zone_id: 1200 })]
        );

        // The world affirms: the requester gets a routable endpoint.
        handle_frame(
            &mut m,
            world,
            MasterReq::AffirmTransferResponse { request_id: 7 }.encode(),
        );
        let out = sent(&mut m);
        assert_eq!(out.len(), 1);
        match &out[0] {
            (
                Some(addr),
                MasterResp::ZoneTransferResponse {
                    request_id,
                    mythran_shift,
                    map_id,
                    instance_id: inst,
                    clone_id,
                    ip,
                    port,
                },
            ) => {
                assert_eq!(*addr, requester);
                assert_eq!(*request_id, 7);
                assert!(!mythran_shift);
                assert_eq!(*map_id, 1200);
                assert_eq!(*inst, instance_id);
                assert_eq!(*clone_id, 0);
                assert_eq!(ip, &m.im.get(0).ip);
                assert_eq!(*port, m.im.get(0).port);
            }
            other => panic!("unexpected send: {other:?}"),
        }
    }

    #[test]
    fn session_displacement_broadcasts_between_inserts() {
        let mut m = master();

        handle_frame(
            &mut m,
            peer(1),
            MasterReq::SetSessionKey {
                session_key: 100,
                username: "alice".to_string(),
            }
            .encode(),
        );
        assert!(sent(&mut m).is_empty());

        handle_frame(
            &mut m,
            peer(1),
            MasterReq::SetSessionKey {
                session_key: 200,
                username: "alice".to_string(),
            }
            .encode(),
        );
        assert_eq!(
            sent(&mut m),
            vec![(
                None,
                MasterResp::NewSessionAlert {
                    session_key: 200,
                    username: "alice".to_string(),
                }
            )]
        );
        assert_eq!(m.sessions.len(), 1);
        assert_eq!(m.sessions.find_key("alice"), Some(200));
    }

    #[test]
    fn session_lookup_answers_only_on_a_hit() {
        let mut m = master();
        let asker = peer(2);

        handle_frame(
            &mut m,
            asker,
            MasterReq::RequestSessionKey {
                username: "alice".to_string(),
            }
            .encode(),
        );
        assert!(sent(&mut m).is_empty());

        handle_frame(
            &mut m,
            peer(1),
            MasterReq::SetSessionKey {
                session_key: 100,
                username: "alice".to_string(),
            }
            .encode(),
        );
        handle_frame(
            &mut m,
            asker,
            MasterReq::RequestSessionKey {
                username: "alice".to_string(),
            }
            .encode(),
        );
        assert_eq!(
            sent(&mut m),
            vec![(
                Some(asker),
                MasterResp::SessionKeyResponse {
                    session_key: 100,
                    username: "alice".to_string(),
                }
            )]
        );
    }

    #[test]
    fn private_zone_join_skips_affirmation_and_keeps_clone() {
        let mut m = master();
        let requester = peer(1);

        handle_frame(
            &mut m,
            peer(8),
            MasterReq::CreatePrivateZone {
                map_id: 1300,
                clone_id: 5,
                password: "hunter2".to_string(),
            }
            .encode(),
        );
        handle_frame(
            &mut m,
            requester,
            MasterReq::RequestPrivateZone {
                request_id: 9,
                mythran_shift: true,
                password: "hunter2".to_string(),
            }
            .encode(),
        );

        let out = sent(&mut m);
        assert_eq!(out.len(), 1);
        match &out[0] {
            (
                Some(addr),
                MasterResp::ZoneTransferResponse {
                    request_id,
                    mythran_shift,
                    clone_id,
                    ..
                },
            ) => {
                assert_eq!(*addr, requester);
                assert_eq!(*request_id, 9);
                assert!(*mythran_shift);
                assert_eq!(*clone_id, 5);
            }
            other => panic!("unexpected send: {other:?}"),
        }

        // Wrong password: silence, the client times out on its own.
        handle_frame(
            &mut m,
            requester,
            MasterReq::RequestPrivateZone {
                request_id: 10,
                mythran_shift: false,
                password: "wrong".to_string(),
            }
            .encode(),
        );
        assert!(sent(&mut m).is_empty());
    }

    #[test]
    fn surviving_world_is_reconstructed_from_server_info() {
        let mut m = master();
        let world = peer(9);

        handle_frame(
            &mut m,
            world,
            MasterReq::ServerInfo {
                port: 4000,
                zone_id: 1200,
                instance_id: 4,
                role: ServerRole::World,
                ip: "10.0.0.5".to_string(),
            }
            .encode(),
        );

        let idx = m.im.find_by_map_and_instance(1200, 4).expect("adopted");
        assert_eq!(m.im.get(idx).ip, "10.0.0.5");
        assert_eq!(m.im.get(idx).port, 4000);
        assert_eq!(m.im.get(idx).sys_addr, Some(world));

        // Same announcement again: the port is known, only the transport
        // identity refreshes.
        let reconnected = peer(10);
        handle_frame(
            &mut m,
            reconnected,
            MasterReq::ServerInfo {
                port: 4000,
                zone_id: 1200,
                instance_id: 4,
                role: ServerRole::World,
                ip: "10.0.0.5".to_string(),
            }
            .encode(),
        );
        assert_eq!(m.im.instances().len(), 1);
        assert_eq!(m.im.get(idx).sys_addr, Some(reconnected));
    }

    #[test]
    fn chat_peer_is_remembered_and_respawned_on_loss() {
        let mut m = master();
        let chat = peer(3);

        handle_frame(
            &mut m,
            chat,
            MasterReq::ServerInfo {
                port: 2005,
                zone_id: 0,
                instance_id: 0,
                role: ServerRole::Chat,
                ip: "10.0.0.3".to_string(),
            }
            .encode(),
        );
        assert_eq!(m.chat_peer, Some(chat));

        handle_disconnect(&mut m, chat, false);
        assert_eq!(m.chat_peer, None);
    }

    #[test]
    fn disconnect_drops_the_instance_record() {
        let mut m = master();
        let world = peer(9);

        handle_frame(
            &mut m,
            world,
            MasterReq::ServerInfo {
                port: 4000,
                zone_id: 1200,
                instance_id: 4,
                role: ServerRole::World,
                ip: "10.0.0.5".to_string(),
            }
            .encode(),
        );
        assert_eq!(m.im.instances().len(), 1);

        handle_disconnect(&mut m, world, true);
        assert!(m.im.is_empty());

        // A stale affirmation from the dead peer is ignored silently.
        handle_frame(
            &mut m,
            world,
            MasterReq::AffirmTransferResponse { request_id: 1 }.encode(),
        );
        assert!(sent(&mut m).is_empty());
    }

    #[test]
    fn persistent_ids_are_strictly_increasing_over_requests() {
        let mut m = master();
        let asker = peer(4);

        for request_id in [10u64, 11, 12] {
            handle_frame(
                &mut m,
                asker,
                MasterReq::RequestPersistentId { request_id }.encode(),
            );
        }

        let ids: Vec<u32> = sent(&mut m)
            .into_iter()
            .map(|(_, resp)| match resp {
                MasterResp::PersistentIdResponse { object_id, .. } => object_id,
                other => panic!("unexpected send: {other:?}"),
            })
            .collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn instance_list_goes_to_the_responding_instance() {
        let mut m = master();
        let world = peer(9);

        handle_frame(
            &mut m,
            world,
            MasterReq::ServerInfo {
                port: 4000,
                zone_id: 1000,
                instance_id: 1,
                role: ServerRole::World,
                ip: "10.0.0.5".to_string(),
            }
            .encode(),
        );
        handle_frame(
            &mut m,
            world,
            MasterReq::GetInstances {
                object_id: 77,
                zone_id: Some(1000),
                responding_zone_id: 1000,
                responding_instance_id: 1,
            }
            .encode(),
        );

        assert_eq!(
            sent(&mut m),
            vec![(
                Some(world),
                MasterResp::RespondInstances {
                    object_id: 77,
                    zones: vec![(1000, 0, 1)],
                }
            )]
        );

        // Unknown responding instance: nothing is sent.
        handle_frame(
            &mut m,
            world,
            MasterReq::GetInstances {
                object_id: 78,
                zone_id: None,
                responding_zone_id: 1300,
                responding_instance_id: 9,
            }
            .encode(),
        );
        assert!(sent(&mut m).is_empty());
    }

    #[test]
    fn shutdown_response_completes_the_instance() {
        let mut m = master();
        let world = peer(9);

        handle_frame(
            &mut m,
            world,
            MasterReq::ServerInfo {
                port: 4000,
                zone_id: 1200,
                instance_id: 4,
                role: ServerRole::World,
                ip: "10.0.0.5".to_string(),
            }
            .encode(),
        );
        handle_frame(&mut m, world, MasterReq::ShutdownResponse.encode());

        assert!(m.im.get(0).shutdown_complete);
        let gone = m.im.reap();
        assert_eq!(gone.len(), 1);
        assert!(m.im.is_empty());
    }

    #[test]
    fn malformed_frames_are_dropped() {
        let mut m = master();
        handle_frame(&mut m, peer(1), Bytes::from_static(b"\x53\x4d\x00"));
        handle_frame(&mut m, peer(1), Bytes::from_static(b"junkjunk"));
        assert!(sent(&mut m).is_empty());
        assert!(m.im.is_empty());
    }
}
