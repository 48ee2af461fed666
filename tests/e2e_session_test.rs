//! E2E Session Tests
//!
//! Drives both ends of a session through the public API only:
//! - pairing -> presence -> key exchange -> ratchet
//! - terminal traffic in both directions over an in-process relay
//! - an active relay substituting keys or tampering with envelopes

use std::sync::Arc;

use botster_e2e::{
    key_exchange::derive_shared_secret, pairing_url, parse_pairing_token, ChannelRelay, Config,
    DeviceIdentity, Envelope, Handshake, KeyStore, MemoryKeyStore, PresenceAnnouncement,
    RatchetKeyPair, RatchetLimits, RatchetSession, RelayMessage, Role, SessionError, SessionService,
    TerminalEvent, TerminalSession,
};
use tokio::sync::mpsc::UnboundedReceiver;
use x25519_dalek::StaticSecret;

struct Established {
    cli: TerminalSession,
    browser: TerminalSession,
    from_cli: UnboundedReceiver<RelayMessage>,
    from_browser: UnboundedReceiver<RelayMessage>,
    cli_store: MemoryKeyStore,
    browser_store: MemoryKeyStore,
    cli_identity: Arc<DeviceIdentity>,
}

fn establish() -> Established {
    establish_between(
        Arc::new(DeviceIdentity::generate()),
        Arc::new(DeviceIdentity::generate()),
    )
}

fn establish_between(
    cli_identity: Arc<DeviceIdentity>,
    browser_identity: Arc<DeviceIdentity>,
) -> Established {
    let url = pairing_url(
        "https://trybotster.com/hubs/42",
        "hub-42-session",
        &cli_identity.encryption_public_key(),
    );
    let token = parse_pairing_token(&url).unwrap();

    let cli = Handshake::new(
        Arc::clone(&cli_identity),
        Role::Cli,
        token.session_id.clone(),
        Config::default(),
    )
    .with_display_name("devbox");
    let browser = Handshake::from_pairing_token(browser_identity, &token, Config::default())
        .with_display_name("Firefox");

    let (cli_relay, mut from_cli) = ChannelRelay::new();
    let (browser_relay, mut from_browser) = ChannelRelay::new();
    cli.announce(&cli_relay).unwrap();
    browser.announce(&browser_relay).unwrap();
    let cli_presence = from_cli.try_recv().unwrap().payload;
    let browser_presence = from_browser.try_recv().unwrap().payload;

    let cli_store = MemoryKeyStore::new();
    let browser_store = MemoryKeyStore::new();
    let cli_session = cli
        .complete(&browser_presence, &cli_store, Arc::new(cli_relay))
        .unwrap();
    let browser_session = browser
        .complete(&cli_presence, &browser_store, Arc::new(browser_relay))
        .unwrap();

    Established {
        cli: cli_session,
        browser: browser_session,
        from_cli,
        from_browser,
        cli_store,
        browser_store,
        cli_identity,
    }
}

fn next(rx: &mut UnboundedReceiver<RelayMessage>) -> Vec<u8> {
    rx.try_recv().expect("relay message").payload
}

// === Ratchet-level scenario ===

#[test]
fn test_ratchet_exchange_between_paired_devices() {
    let cli_secret = [0x11u8; 32];
    let browser_secret = [0x22u8; 32];
    let cli = DeviceIdentity::from_secrets(&cli_secret, &[0x33u8; 32]);
    let browser = DeviceIdentity::from_secrets(&browser_secret, &[0x44u8; 32]);

    // Both sides reach the same secret from each other's public keys.
    let cli_shared = derive_shared_secret(
        &browser.encryption_public_key(),
        &StaticSecret::from(cli_secret),
    )
    .unwrap();
    let browser_shared = derive_shared_secret(
        &cli.encryption_public_key(),
        &StaticSecret::from(browser_secret),
    )
    .unwrap();
    assert_eq!(cli_shared.as_bytes(), browser_shared.as_bytes());

    // Fresh per-session ratchet keys, as exchanged in the presence step.
    let cli_ratchet = RatchetKeyPair::generate();
    let browser_ratchet = RatchetKeyPair::generate();
    let cli_ratchet_public = *cli_ratchet.public_key();
    let browser_ratchet_public = *browser_ratchet.public_key();

    let mut initiator = RatchetSession::initiator(
        cli_shared.as_bytes(),
        cli_ratchet,
        &browser_ratchet_public,
        RatchetLimits::default(),
    )
    .unwrap();
    let mut responder = RatchetSession::responder(
        browser_shared.as_bytes(),
        browser_ratchet,
        &cli_ratchet_public,
        RatchetLimits::default(),
    )
    .unwrap();

    let input = br#"{"type":"input","data":"ls\n"}"#;
    let envelope = initiator.encrypt(input).unwrap();
    let wire = envelope.to_bytes();
    assert!(!wire.windows(input.len()).any(|w| w == input));

    let received = Envelope::from_bytes(&wire).unwrap();
    assert_eq!(responder.decrypt(&received).unwrap(), input);

    let output = br#"{"type":"output","data":"file.txt\n"}"#;
    let reply = responder.encrypt(output).unwrap();
    assert_ne!(reply.header.ratchet_key, envelope.header.ratchet_key);
    assert_eq!(initiator.decrypt(&reply).unwrap(), output);

    initiator.zeroize();
    responder.zeroize();
    assert!(matches!(
        initiator.encrypt(b"after"),
        Err(SessionError::NotReady(_))
    ));
}

// === Full session ===

#[test]
fn test_terminal_traffic_both_directions() {
    let mut s = establish();

    // Opening ping from the CLI arms the browser; the browser answers with a pong.
    let ping = next(&mut s.from_cli);
    assert_eq!(s.browser.on_transport_message(&ping).unwrap(), None);
    let pong = next(&mut s.from_browser);
    assert_eq!(s.cli.on_transport_message(&pong).unwrap(), None);

    s.browser.send_input("ls\n").unwrap();
    s.browser.send_resize(120, 40).unwrap();
    let input = next(&mut s.from_browser);
    let resize = next(&mut s.from_browser);
    assert_eq!(
        s.cli.on_transport_message(&input).unwrap(),
        Some(TerminalEvent::Input("ls\n".into()))
    );
    assert_eq!(
        s.cli.on_transport_message(&resize).unwrap(),
        Some(TerminalEvent::Resize {
            cols: 120,
            rows: 40
        })
    );

    s.cli.send_output("file.txt\n").unwrap();
    let output = next(&mut s.from_cli);
    assert_eq!(
        s.browser.on_transport_message(&output).unwrap(),
        Some(TerminalEvent::Output("file.txt\n".into()))
    );

    assert_eq!(s.browser.peer().display_name, "devbox");
    assert_eq!(s.cli.peer().display_name, "Firefox");
    assert_eq!(s.browser_store.list_peer_keys().unwrap().len(), 1);
    assert_eq!(s.cli_store.list_peer_keys().unwrap().len(), 1);
}

#[test]
fn test_out_of_order_delivery_is_tolerated() {
    let mut s = establish();
    let ping = next(&mut s.from_cli);
    s.browser.on_transport_message(&ping).unwrap();
    let _pong = next(&mut s.from_browser);

    for chunk in ["a", "b", "c"] {
        s.cli.send_output(chunk).unwrap();
    }
    let first = next(&mut s.from_cli);
    let second = next(&mut s.from_cli);
    let third = next(&mut s.from_cli);

    for (message, expected) in [(third, "c"), (first, "a"), (second, "b")] {
        assert_eq!(
            s.browser.on_transport_message(&message).unwrap(),
            Some(TerminalEvent::Output(expected.into()))
        );
    }
}

#[test]
fn test_tampered_envelope_is_dropped_and_session_continues() {
    let mut s = establish();
    let ping = next(&mut s.from_cli);
    s.browser.on_transport_message(&ping).unwrap();

    s.cli.send_output("secret").unwrap();
    let mut tampered = next(&mut s.from_cli);
    let last = tampered.len() - 1;
    tampered[last] ^= 0x01;

    let err = s.browser.on_transport_message(&tampered).unwrap_err();
    assert!(matches!(err, SessionError::Decrypt(_)));
    assert!(err.is_recoverable());
    assert!(!s.browser.is_closed());

    s.cli.send_output("still here").unwrap();
    let good = next(&mut s.from_cli);
    assert_eq!(
        s.browser.on_transport_message(&good).unwrap(),
        Some(TerminalEvent::Output("still here".into()))
    );
}

#[test]
fn test_repeated_garbage_desynchronizes() {
    let mut s = establish();
    let ping = next(&mut s.from_cli);
    let mut envelope = Envelope::from_bytes(&ping).unwrap();
    envelope.tag = [0u8; 16];
    let forged = envelope.to_bytes();

    let limit = Config::default().max_decrypt_failures;
    for _ in 1..limit {
        assert!(matches!(
            s.browser.on_transport_message(&forged),
            Err(SessionError::Decrypt(_))
        ));
    }
    assert!(matches!(
        s.browser.on_transport_message(&forged),
        Err(SessionError::Desynchronized(n)) if n == limit
    ));
    assert!(s.browser.is_closed());
    assert!(s.browser.is_zeroized());
}

#[test]
fn test_close_reaches_peer_and_wipes_both_sides() {
    let mut s = establish();
    let ping = next(&mut s.from_cli);
    s.browser.on_transport_message(&ping).unwrap();

    s.cli.close(Some("hub stopped"));
    assert!(s.cli.is_zeroized());

    let close = next(&mut s.from_cli);
    assert_eq!(
        s.browser.on_transport_message(&close).unwrap(),
        Some(TerminalEvent::Closed {
            reason: Some("hub stopped".into())
        })
    );
    assert!(s.browser.is_zeroized());
    assert!(matches!(
        s.browser.send_input("x"),
        Err(SessionError::NotReady(_))
    ));
}

// === Active attacker ===

#[test]
fn test_relay_cannot_substitute_cli_key() {
    let cli_identity = DeviceIdentity::generate();
    let mallory = DeviceIdentity::generate();
    let url = pairing_url(
        "https://trybotster.com/hubs/42",
        "hub-42",
        &cli_identity.encryption_public_key(),
    );
    let token = parse_pairing_token(&url).unwrap();
    let browser = Handshake::from_pairing_token(
        Arc::new(DeviceIdentity::generate()),
        &token,
        Config::default(),
    );

    let mallory_ratchet = RatchetKeyPair::generate();
    let forged =
        PresenceAnnouncement::new(&mallory, mallory_ratchet.public_key(), "Botster CLI")
            .to_bytes()
            .unwrap();
    let store = MemoryKeyStore::new();
    let (relay, mut sent) = ChannelRelay::new();

    let err = browser
        .complete(&forged, &store, Arc::new(relay))
        .unwrap_err();
    assert!(matches!(err, SessionError::PresenceMismatch(_)));
    assert!(!err.is_recoverable());
    assert!(store.list_peer_keys().unwrap().is_empty());
    assert!(sent.try_recv().is_err());
}

#[test]
fn test_recorded_session_cannot_be_replayed_into_new_one() {
    let cli_identity = Arc::new(DeviceIdentity::generate());
    let browser_identity = Arc::new(DeviceIdentity::generate());

    let mut earlier =
        establish_between(Arc::clone(&cli_identity), Arc::clone(&browser_identity));
    let recorded_ping = next(&mut earlier.from_cli);
    earlier.cli.send_output("secret-one").unwrap();
    let recorded_output = next(&mut earlier.from_cli);

    // Same two devices, new session: the relay replays the old traffic first.
    let mut later = establish_between(cli_identity, browser_identity);
    assert_ne!(recorded_ping, next(&mut later.from_cli));
    for replayed in [&recorded_ping, &recorded_output] {
        assert!(matches!(
            later.browser.on_transport_message(replayed),
            Err(SessionError::Decrypt(_))
        ));
    }
    assert!(!later.browser.can_send());
}

#[test]
fn test_browser_remembers_cli_fingerprint() {
    let s = establish();
    let stored = s
        .browser_store
        .get_peer_key(&s.cli_identity.fingerprint())
        .unwrap()
        .unwrap();
    assert_eq!(stored.public_key, s.cli_identity.encryption_public_key());
    assert_eq!(stored.display_name, "devbox");
}

// === Session service ===

#[tokio::test]
async fn test_services_exchange_through_relay() {
    let s = establish();
    let Established {
        cli,
        browser,
        mut from_cli,
        mut from_browser,
        ..
    } = s;

    let (cli_events_tx, mut cli_events) = tokio::sync::mpsc::unbounded_channel();
    let (browser_events_tx, mut browser_events) = tokio::sync::mpsc::unbounded_channel();
    let (cli_handle, cli_task) = SessionService::start(cli, cli_events_tx);
    let (browser_handle, browser_task) = SessionService::start(browser, browser_events_tx);

    // Opening ping, then the browser's pong.
    browser_handle
        .deliver(from_cli.recv().await.unwrap().payload)
        .await
        .unwrap();
    cli_handle
        .deliver(from_browser.recv().await.unwrap().payload)
        .await
        .unwrap();

    browser_handle.send_input("whoami\n").await.unwrap();
    cli_handle
        .deliver(from_browser.recv().await.unwrap().payload)
        .await
        .unwrap();
    assert_eq!(
        cli_events.recv().await.unwrap(),
        TerminalEvent::Input("whoami\n".into())
    );

    cli_handle.send_output("botster\n").await.unwrap();
    browser_handle
        .deliver(from_cli.recv().await.unwrap().payload)
        .await
        .unwrap();
    assert_eq!(
        browser_events.recv().await.unwrap(),
        TerminalEvent::Output("botster\n".into())
    );

    cli_handle.shutdown(Some("bye")).await.unwrap();
    let cli = cli_task.await.unwrap();
    assert!(cli.is_zeroized());

    browser_handle
        .deliver(from_cli.recv().await.unwrap().payload)
        .await
        .unwrap();
    assert_eq!(
        browser_events.recv().await.unwrap(),
        TerminalEvent::Closed {
            reason: Some("bye".into())
        }
    );
    let browser = browser_task.await.unwrap();
    assert!(browser.is_zeroized());
    assert!(browser_handle.is_closed());
}
