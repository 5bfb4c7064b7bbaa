// Runs the bundled recipient domain filter as real child processes.
use std::time::Duration;

use filter_api::{Channel, Frame, MailAddress};
use mfa::agent::Agent;
use mfa::envelope::{Envelope, FilterDef, SubmitStatus};
use mfa::imsg::ImsgType;
use mfa::logging::LogHandle;
use mfa::peer::Peer;
use serde::Serialize;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

type Duplex = Channel<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

fn connect(agent: &mut Agent, peer: Peer) -> Duplex {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (ar, aw) = tokio::io::split(a);
    let (br, bw) = tokio::io::split(b);
    agent.attach(peer, Channel::new(ar, aw));
    Channel::new(br, bw)
}

fn send<T: Serialize>(channel: &mut Duplex, ty: ImsgType, value: &T) {
    channel.send(ty.compose(value).unwrap());
}

async fn expect(channel: &mut Duplex, ty: ImsgType) -> SubmitStatus {
    let frame = channel.recv().await.unwrap().expect("agent hung up");
    assert_eq!(ImsgType::from_tag(frame.tag), Some(ty));
    ty.decode(&frame.payload).unwrap()
}

fn rcpt(id: u64, user: &str, domain: &str) -> Envelope {
    Envelope {
        session_id: id,
        rcpt: MailAddress::new(user, domain),
        ..Default::default()
    }
}

const PLUGIN: &str = env!("CARGO_BIN_EXE_filter-rcpt-domains");

fn filter(name: &str, path: &str, args: &[&str]) -> FilterDef {
    FilterDef {
        name: name.into(),
        path: path.into(),
        args: args.iter().map(|a| a.to_string()).collect(),
    }
}

#[tokio::test]
async fn configured_filters_refuse_blocked_domains() {
    let (_layer, log) = LogHandle::new("info").unwrap();
    let mut agent = Agent::new(log);
    let mut parent = connect(&mut agent, Peer::Parent);
    let mut smtp = connect(&mut agent, Peer::Smtp);
    let mut lookup = connect(&mut agent, Peer::Lookup);
    let task = tokio::spawn(agent.run());

    // "late" only registers once "rcpt-domains" has started, so both must be
    // running before the agent waits for either.
    let dir = tempfile::tempdir().unwrap();
    let flag = dir.path().join("started");
    let flag = flag.to_str().unwrap();
    let late = filter(
        "late",
        "sh",
        &[
            "-c",
            r#"while [ ! -e "$0" ]; do sleep 0.1; done; exec "$1" late.example"#,
            flag,
            PLUGIN,
        ],
    );
    let blocking = filter(
        "rcpt-domains",
        "sh",
        &["-c", r#"touch "$0"; exec "$1" blocked.example"#, flag, PLUGIN],
    );

    parent.send(Frame::new(ImsgType::ConfStart.tag(), Vec::new()));
    send(&mut parent, ImsgType::ConfFilter, &late);
    send(
        &mut parent,
        ImsgType::ConfFilter,
        &filter("rcpt-domains", PLUGIN, &["other.example"]),
    );
    // Same name, so this replaces the definition above in place.
    send(&mut parent, ImsgType::ConfFilter, &blocking);
    parent.send(Frame::new(ImsgType::ConfEnd.tag(), Vec::new()));
    parent.flush().await.unwrap();

    // Events are handled in arrival order; let the configuration land first.
    tokio::time::sleep(Duration::from_millis(200)).await;

    send(&mut smtp, ImsgType::MfaRcpt, &rcpt(0x41, "al", "late.example"));
    let ss = expect(&mut smtp, ImsgType::MfaRcpt).await;
    assert_eq!((ss.id, ss.code), (0x41, 550));
    assert_eq!(
        ss.status_line,
        "5.7.1 Recipient domain late.example not accepted"
    );

    send(&mut smtp, ImsgType::MfaRcpt, &rcpt(0x42, "bob", "blocked.example"));
    let ss = expect(&mut smtp, ImsgType::MfaRcpt).await;
    assert_eq!((ss.id, ss.code), (0x42, 550));
    assert_eq!(
        ss.status_line,
        "5.7.1 Recipient domain blocked.example not accepted"
    );

    send(&mut smtp, ImsgType::MfaRcpt, &rcpt(0x43, "carol", "other.example"));
    let ss = expect(&mut lookup, ImsgType::LkaRulematch).await;
    assert_eq!(ss.id, 0x43);
    assert_eq!(ss.addr, MailAddress::new("carol", "other.example"));

    drop(smtp);
    tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .expect("agent did not stop")
        .unwrap()
        .unwrap();
}
