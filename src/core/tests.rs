#[cfg(test)]
mod tests_impl {
    use crate::core::composer::{self, Params, Ruleset, TargetState};
    use crate::core::error::{ApplyError, Error, InstallError};
    use crate::core::filter::{Packet, Weight};
    use crate::core::identity::{RuleName, Sublayer};
    use crate::core::killswitch::KillSwitch;
    use crate::core::memory::{FailurePoint, InstallerCall, MemoryEngine};
    use crate::core::predicate::{Action, Protocol};
    use crate::core::rules::Rule;
    use crate::core::test_helpers::{
        connected_state, connecting_state, permissive_params, relay,
    };
    use std::net::IpAddr;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn installed(state: &TargetState, params: &Params) -> MemoryEngine {
        let mut engine = MemoryEngine::new();
        composer::install(&composer::compose(state, params), &mut engine).unwrap();
        engine
    }

    #[test]
    fn test_connecting_installs_three_filters_in_one_session() {
        let ruleset = composer::compose(&connecting_state(), &Params::default());
        assert_eq!(
            ruleset.rules.iter().map(Rule::name).collect::<Vec<_>>(),
            vec![
                RuleName::BlockAll,
                RuleName::PermitVpnRelay,
                RuleName::PermitDns
            ]
        );

        let mut engine = MemoryEngine::new();
        composer::install(&ruleset, &mut engine).unwrap();

        let journal = engine.journal();
        assert_eq!(journal.len(), 5);
        assert_eq!(journal[0], InstallerCall::Begin);
        assert!(
            journal[1..4]
                .iter()
                .all(|c| matches!(c, InstallerCall::AddFilter(_)))
        );
        assert_eq!(journal[4], InstallerCall::Commit);
        assert_eq!(engine.active().len(), 3);
    }

    #[test]
    fn test_connecting_permits_only_relay_client_and_dns() {
        let engine = installed(&connecting_state(), &Params::default());

        let to_relay = Packet::outbound(Protocol::Tcp, ip("10.0.0.1"), Some(443));
        assert_eq!(
            engine.evaluate(&to_relay.clone().from_application("app.exe")),
            Action::Permit
        );
        assert_eq!(
            engine.evaluate(&to_relay.from_application("other.exe")),
            Action::Block
        );

        let dns = Packet::outbound(Protocol::Udp, ip("9.9.9.9"), Some(53));
        assert_eq!(engine.evaluate(&dns), Action::Permit);

        let web = Packet::outbound(Protocol::Tcp, ip("203.0.113.9"), Some(443));
        assert_eq!(engine.evaluate(&web), Action::Block);
    }

    #[test]
    fn test_reapplying_a_state_is_idempotent() {
        let ruleset = composer::compose(&connected_state(), &permissive_params());
        let mut engine = MemoryEngine::new();

        composer::install(&ruleset, &mut engine).unwrap();
        let first = engine.active().to_vec();

        composer::install(&ruleset, &mut engine).unwrap();
        assert_eq!(engine.active(), first.as_slice());
        assert_eq!(engine.generation(), 2);
    }

    #[test]
    fn test_failure_at_every_filter_keeps_previous_rules() {
        let target = composer::compose(&connected_state(), &permissive_params());
        let filter_count = target.filters().unwrap().len();
        assert!(filter_count > 10);

        for n in 1..=filter_count {
            let mut engine = installed(&TargetState::Blocked, &Params::default());
            let before = engine.active().to_vec();
            engine.clear_journal();

            engine.fail_at(FailurePoint::AddFilter(n));
            let err = composer::install(&target, &mut engine).unwrap_err();

            assert!(
                matches!(err, ApplyError::FilterRejected { .. }),
                "filter {n}: {err}"
            );
            assert_eq!(engine.active(), before.as_slice(), "filter {n}");
            assert_eq!(engine.generation(), 1);
            assert_eq!(engine.add_filter_calls(), n);
            assert_eq!(engine.journal().last(), Some(&InstallerCall::Abort));
            assert!(!engine.journal().contains(&InstallerCall::Commit));
        }
    }

    #[test]
    fn test_commit_failure_keeps_previous_rules() {
        let mut engine = installed(&TargetState::Blocked, &Params::default());
        let before = engine.active_keys();

        engine.fail_at(FailurePoint::Commit);
        let err = composer::install(
            &composer::compose(&connecting_state(), &Params::default()),
            &mut engine,
        )
        .unwrap_err();

        assert!(matches!(
            err,
            ApplyError::Session(InstallError::Commit { .. })
        ));
        assert_eq!(engine.active_keys(), before);
    }

    #[test]
    fn test_begin_failure_adds_nothing() {
        let mut engine = MemoryEngine::new();
        engine.fail_at(FailurePoint::Begin);

        let err = composer::install(
            &composer::compose(&TargetState::Blocked, &Params::default()),
            &mut engine,
        )
        .unwrap_err();

        assert!(matches!(err, ApplyError::Session(InstallError::Session(_))));
        assert_eq!(engine.add_filter_calls(), 0);
        assert!(engine.active().is_empty());
    }

    #[test]
    fn test_invalid_relay_never_reaches_installer() {
        let mut bad = relay();
        bad.address = "relay.example.net".to_string();

        let mut engine = MemoryEngine::new();
        let err = composer::install(
            &composer::compose(&TargetState::Connecting { relay: bad }, &Params::default()),
            &mut engine,
        )
        .unwrap_err();

        assert_eq!(err.rule(), Some(RuleName::PermitVpnRelay));
        assert!(engine.journal().is_empty());
    }

    #[test]
    fn test_block_all_is_lightest_filter() {
        let states = [
            TargetState::Blocked,
            TargetState::Disconnected,
            connecting_state(),
            connected_state(),
        ];

        for state in states {
            let filters = composer::compose(&state, &permissive_params())
                .filters()
                .unwrap();
            let block_all: Vec<_> = filters
                .iter()
                .filter(|f| f.identity == RuleName::BlockAll.identity())
                .collect();

            assert_eq!(block_all.len(), 1, "{state}");
            assert_eq!(block_all[0].weight, Weight::BLOCK);
            assert_eq!(block_all[0].sublayer, Sublayer::Baseline);
            assert!(block_all[0].conditions.is_empty());

            for filter in filters.iter().filter(|f| f.action == Action::Permit) {
                assert!(filter.weight > Weight::BLOCK, "{filter}");
            }
        }
    }

    #[test]
    fn test_unknown_traffic_blocked_in_every_closed_state() {
        let stray = [
            Packet::outbound(Protocol::Tcp, ip("203.0.113.9"), Some(80)),
            Packet::outbound(Protocol::Udp, ip("2001:db8::9"), Some(4500)),
            Packet::inbound(Protocol::Tcp, ip("198.51.100.20"), Some(22)),
        ];

        for state in [TargetState::Blocked, connecting_state(), connected_state()] {
            let engine = installed(&state, &Params::default());
            for packet in &stray {
                assert_eq!(engine.evaluate(packet), Action::Block, "{state}: {packet:?}");
            }
        }
    }

    #[test]
    fn test_pass_through_disconnected_installs_nothing() {
        let mut engine = installed(&TargetState::Blocked, &Params::default());
        composer::install(
            &composer::compose(&TargetState::Disconnected, &Params::default()),
            &mut engine,
        )
        .unwrap();

        assert!(engine.active().is_empty());
        let web = Packet::outbound(Protocol::Tcp, ip("203.0.113.9"), Some(443));
        assert_eq!(engine.evaluate(&web), Action::Permit);
    }

    #[test]
    fn test_dns_sublayer_decides_before_lan_permit() {
        let params = Params {
            allow_lan: true,
            ..Params::default()
        };
        let engine = installed(&connected_state(), &params);

        // A resolver on the LAN is matched by permit-lan in the baseline
        // sublayer, but block-dns decides first.
        let lan_dns = Packet::outbound(Protocol::Udp, ip("192.168.1.1"), Some(53));
        assert!(engine.active().iter().any(|f| {
            f.sublayer == Sublayer::Baseline
                && f.action == Action::Permit
                && f.matches(&lan_dns)
        }));

        let decided = engine.decide(&lan_dns).unwrap();
        assert_eq!(decided.identity, RuleName::BlockDns.identity());
        assert_eq!(engine.evaluate(&lan_dns), Action::Block);

        let lan_web = Packet::outbound(Protocol::Tcp, ip("192.168.1.1"), Some(80));
        assert_eq!(engine.evaluate(&lan_web), Action::Permit);
    }

    #[test]
    fn test_connected_dns_only_through_tunnel_resolver() {
        let engine = installed(&connected_state(), &Params::default());

        let tunnel_dns =
            Packet::outbound(Protocol::Udp, ip("10.64.0.1"), Some(53)).on_interface("wg0");
        assert_eq!(engine.evaluate(&tunnel_dns), Action::Permit);

        let other_resolver =
            Packet::outbound(Protocol::Udp, ip("9.9.9.9"), Some(53)).on_interface("wg0");
        assert_eq!(engine.evaluate(&other_resolver), Action::Block);

        let outside_tunnel = Packet::outbound(Protocol::Udp, ip("10.64.0.1"), Some(53));
        assert_eq!(engine.evaluate(&outside_tunnel), Action::Block);

        let tunnel_web =
            Packet::outbound(Protocol::Tcp, ip("203.0.113.9"), Some(443)).on_interface("wg0");
        assert_eq!(engine.evaluate(&tunnel_web), Action::Permit);
    }

    #[test]
    fn test_relay_on_dns_port_survives_block_dns() {
        let mut dns_relay = relay();
        dns_relay.port = 53;
        dns_relay.protocol = Protocol::Udp;
        let state = TargetState::Connected {
            relay: dns_relay,
            tunnel: crate::core::composer::TunnelParams {
                interface: "wg0".to_string(),
                dns_servers: Vec::new(),
            },
        };
        let engine = installed(&state, &Params::default());

        let to_relay = Packet::outbound(Protocol::Udp, ip("10.0.0.1"), Some(53))
            .from_application("app.exe");
        assert_eq!(engine.evaluate(&to_relay), Action::Permit);
    }

    #[test]
    fn test_killswitch_failure_keeps_active_state() {
        let mut switch = KillSwitch::new(MemoryEngine::new());
        let blocked = switch
            .set_state(&TargetState::Blocked, &Params::default())
            .unwrap()
            .clone();
        let keys = switch.installer().active_keys();

        switch.installer_mut().fail_at(FailurePoint::AddFilter(2));
        let err = switch
            .set_state(&connecting_state(), &Params::default())
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Apply(ApplyError::FilterRejected {
                rule: RuleName::PermitVpnRelay,
                ..
            })
        ));
        assert_eq!(switch.active(), Some(&blocked));
        assert_eq!(switch.installer().active_keys(), keys);
    }

    #[test]
    fn test_killswitch_tracks_active_ruleset() {
        let mut switch = KillSwitch::new(MemoryEngine::new());
        assert!(switch.active().is_none());

        let active = switch
            .set_state(&connecting_state(), &Params::default())
            .unwrap();
        assert_eq!(active.filter_count, 3);
        assert_eq!(active.ruleset.state, connecting_state());
        let fingerprint = active.fingerprint.clone();

        let again = switch
            .set_state(&connecting_state(), &Params::default())
            .unwrap();
        assert_eq!(again.fingerprint, fingerprint);

        let ruleset = composer::compose(&connecting_state(), &Params::default());
        assert!(switch.is_active(&ruleset));
        assert!(!switch.is_active(&composer::compose(
            &TargetState::Blocked,
            &Params::default()
        )));
        assert_eq!(switch.installer().generation(), 2);
    }

    #[test]
    fn test_killswitch_reset_removes_everything() {
        let mut switch = KillSwitch::new(MemoryEngine::new());
        switch
            .set_state(&connected_state(), &permissive_params())
            .unwrap();
        assert!(!switch.installer().active().is_empty());

        let active = switch.reset().unwrap();
        assert_eq!(active.filter_count, 0);
        assert!(active.ruleset.is_empty());
        assert!(switch.is_active(&Ruleset::empty()));

        let engine = switch.into_inner();
        assert!(engine.active().is_empty());
    }

    #[test]
    fn test_invalid_state_is_not_recorded() {
        let mut switch = KillSwitch::new(MemoryEngine::new());
        let mut bad = relay();
        bad.port = 0;

        let err = switch
            .set_state(&TargetState::Connecting { relay: bad }, &Params::default())
            .unwrap_err();

        assert!(matches!(err, Error::Apply(ApplyError::InvalidRule { .. })));
        assert!(switch.active().is_none());
        assert!(switch.installer().journal().is_empty());
    }
}

#[cfg(test)]
mod property_tests {
    use crate::core::composer::{self, Params, RelayEndpoint, TargetState, TunnelParams};
    use crate::core::filter::{Packet, Weight};
    use crate::core::identity::RuleName;
    use crate::core::memory::{FailurePoint, MemoryEngine};
    use crate::core::predicate::{Action, Protocol};
    use crate::core::rules::Rule;
    use proptest::prelude::*;
    use std::net::{IpAddr, Ipv4Addr};

    prop_compose! {
        fn arb_relay()(
            octets in any::<[u8; 4]>().prop_filter("unspecified", |o| *o != [0, 0, 0, 0]),
            port in 1u16..=65535,
            protocol in prop_oneof![Just(Protocol::Tcp), Just(Protocol::Udp)],
            client in proptest::option::of("[a-z]{1,12}\\.exe"),
        ) -> RelayEndpoint {
            RelayEndpoint {
                address: Ipv4Addr::from(octets).to_string(),
                port,
                protocol,
                client,
            }
        }
    }

    fn arb_state() -> impl Strategy<Value = TargetState> {
        prop_oneof![
            Just(TargetState::Disconnected),
            Just(TargetState::Blocked),
            arb_relay().prop_map(|relay| TargetState::Connecting { relay }),
            (arb_relay(), "wg[0-9]", proptest::option::of(Just("10.64.0.1"))).prop_map(
                |(relay, interface, dns)| TargetState::Connected {
                    relay,
                    tunnel: TunnelParams {
                        interface,
                        dns_servers: dns.map(String::from).into_iter().collect(),
                    },
                }
            ),
        ]
    }

    prop_compose! {
        fn arb_params()(
            flags in any::<[bool; 5]>(),
            dns in proptest::option::of(Just("192.0.2.53")),
        ) -> Params {
            Params {
                block_when_disconnected: flags[0],
                allow_loopback: flags[1],
                allow_dhcp: flags[2],
                allow_ndp: flags[3],
                allow_lan: flags[4],
                lan_networks: Vec::new(),
                dns_servers: dns.map(String::from).into_iter().collect(),
                allowed_endpoint: None,
            }
        }
    }

    fn is_pass_through(state: &TargetState, params: &Params) -> bool {
        matches!(state, TargetState::Disconnected) && !params.block_when_disconnected
    }

    proptest! {
        #[test]
        fn test_compose_is_deterministic(state in arb_state(), params in arb_params()) {
            let a = composer::compose(&state, &params);
            let b = composer::compose(&state, &params);

            prop_assert_eq!(&a, &b);
            prop_assert_eq!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
        }

        #[test]
        fn test_every_closed_state_starts_with_block_all(
            state in arb_state(),
            params in arb_params(),
        ) {
            let ruleset = composer::compose(&state, &params);

            if is_pass_through(&state, &params) {
                prop_assert!(ruleset.is_empty());
            } else {
                prop_assert_eq!(ruleset.rules.first(), Some(&Rule::BlockAll));
                let filters = ruleset.filters().unwrap();
                for filter in filters.iter().filter(|f| f.action == Action::Permit) {
                    prop_assert!(filter.weight > Weight::BLOCK);
                }
            }
        }

        #[test]
        fn test_install_then_stray_packet_is_blocked(
            state in arb_state(),
            params in arb_params(),
        ) {
            prop_assume!(!is_pass_through(&state, &params));

            let mut engine = MemoryEngine::new();
            composer::install(&composer::compose(&state, &params), &mut engine).unwrap();

            // TEST-NET-3 on a port no rule opens, from no known application
            let stray = Packet::outbound(
                Protocol::Tcp,
                IpAddr::V4(Ipv4Addr::new(203, 0, 113, 250)),
                Some(9),
            );
            let relay_covers_it = engine
                .decide(&stray)
                .is_some_and(|f| f.identity.name.starts_with(RuleName::PermitVpnRelay.as_ref()));
            prop_assume!(!relay_covers_it);
            prop_assert_eq!(engine.evaluate(&stray), Action::Block);
        }

        #[test]
        fn test_any_failure_point_is_atomic(
            state in arb_state(),
            params in arb_params(),
            pick in any::<prop::sample::Index>(),
        ) {
            let target = composer::compose(&state, &params);
            let count = target.filters().unwrap().len();
            prop_assume!(count > 0);
            let n = pick.index(count) + 1;

            let mut engine = MemoryEngine::new();
            composer::install(&composer::compose(&TargetState::Blocked, &Params::default()), &mut engine)
                .unwrap();
            let before = engine.active().to_vec();

            engine.fail_at(FailurePoint::AddFilter(n));
            prop_assert!(composer::install(&target, &mut engine).is_err());
            prop_assert_eq!(engine.active(), before.as_slice());
        }
    }
}

#[cfg(test)]
mod nft_tests {
    use crate::core::composer::{Params, RelayEndpoint, TargetState};
    use crate::core::error::{ApplyError, Error, InstallError};
    use crate::core::identity::RuleName;
    use crate::core::killswitch::KillSwitch;
    use crate::core::nft::{NftInstaller, TABLE};
    use crate::core::predicate::Protocol;
    use crate::core::test_helpers::{connecting_state, with_mock_nft};

    /// nftables cannot match applications, so nft tests use a relay without one.
    fn connecting_any_client() -> TargetState {
        TargetState::Connecting {
            relay: RelayEndpoint::new("10.0.0.1", 443, Protocol::Tcp),
        }
    }

    fn capture_lines(path: &std::path::Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_nft_installer_checks_then_applies() {
        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("nft.log");
        let capture_str = capture.to_string_lossy().to_string();

        let filter_count = with_mock_nft(&[("MOCK_NFT_CAPTURE", &capture_str)], || {
            let mut switch = KillSwitch::new(NftInstaller::new().verify_before_commit(true));
            let count = switch
                .set_state(&connecting_any_client(), &Params::default())
                .map(|active| active.filter_count);
            (count, switch.installer().committed())
        });

        assert_eq!(filter_count.0.unwrap(), 3);
        assert_eq!(filter_count.1, 3);

        let calls = capture_lines(&capture);
        assert_eq!(calls.len(), 2);
        assert!(calls[0].starts_with("--json --check -f -"));
        assert!(calls[1].starts_with("--json -f -"));
        assert!(calls[1].contains(TABLE));
        assert!(calls[1].contains("10.0.0.1"));
    }

    #[test]
    fn test_nft_rejection_keeps_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("nft.log");
        let capture_str = capture.to_string_lossy().to_string();

        let result = with_mock_nft(
            &[("MOCK_NFT_FAIL", "apply"), ("MOCK_NFT_CAPTURE", &capture_str)],
            || {
                let mut switch = KillSwitch::new(NftInstaller::new());
                let err = switch
                    .set_state(&TargetState::Blocked, &Params::default())
                    .map(|_| ());
                (err, switch.active().is_none(), switch.installer().committed())
            },
        );

        let (err, nothing_active, committed) = result;
        match err {
            Err(Error::Apply(ApplyError::Session(InstallError::Commit {
                stderr, exit_code, ..
            }))) => {
                assert!(stderr.unwrap_or_default().contains("Could not process rule"));
                assert_eq!(exit_code, Some(1));
            }
            other => panic!("expected commit failure, got {other:?}"),
        }
        assert!(nothing_active);
        assert_eq!(committed, 0);
    }

    #[test]
    fn test_failed_check_skips_apply() {
        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("nft.log");
        let capture_str = capture.to_string_lossy().to_string();

        let result = with_mock_nft(
            &[("MOCK_NFT_FAIL", "check"), ("MOCK_NFT_CAPTURE", &capture_str)],
            || {
                KillSwitch::new(NftInstaller::new().verify_before_commit(true))
                    .set_state(&TargetState::Blocked, &Params::default())
                    .map(|_| ())
            },
        );

        assert!(matches!(
            result,
            Err(Error::Apply(ApplyError::Session(InstallError::Commit { .. })))
        ));
        assert_eq!(capture_lines(&capture).len(), 1);
    }

    #[test]
    fn test_application_relay_never_reaches_nft() {
        let dir = tempfile::tempdir().unwrap();
        let capture = dir.path().join("nft.log");
        let capture_str = capture.to_string_lossy().to_string();

        let (result, nothing_active) = with_mock_nft(&[("MOCK_NFT_CAPTURE", &capture_str)], || {
            let mut switch = KillSwitch::new(NftInstaller::new().verify_before_commit(true));
            let result = switch
                .set_state(&connecting_state(), &Params::default())
                .map(|_| ());
            (result, switch.active().is_none())
        });

        match result {
            Err(Error::Apply(ApplyError::FilterRejected {
                rule: RuleName::PermitVpnRelay,
                source: InstallError::Rejected { reason, .. },
            })) => assert!(reason.contains("application match unsupported")),
            other => panic!("expected relay rejection, got {other:?}"),
        }
        assert!(nothing_active);
        assert!(capture_lines(&capture).is_empty());
    }
}
