// Raises SIGTERM in the test process, so it gets a binary of its own.
use std::time::Duration;

use filter_api::{Channel, HookMask};
use mfa::agent::Agent;
use mfa::envelope::{Envelope, FilterDef};
use mfa::filters::spawn_filter;
use mfa::imsg::ImsgType;
use mfa::logging::LogHandle;
use mfa::peer::Peer;
use nix::errno::Errno;
use nix::sys::signal::{kill, raise, Signal};
use nix::unistd::Pid;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

type Duplex = Channel<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

fn pair() -> (Duplex, Duplex) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (ar, aw) = tokio::io::split(a);
    let (br, bw) = tokio::io::split(b);
    (Channel::new(ar, aw), Channel::new(br, bw))
}

#[tokio::test]
async fn sigterm_stops_the_agent_and_reaps_filters() {
    let (_layer, log) = LogHandle::new("info").unwrap();
    let mut agent = Agent::new(log);
    let (local, mut smtp) = pair();
    agent.attach(Peer::Smtp, local);

    // cat runs until the agent closes its stdin.
    let def = FilterDef {
        name: "cat".into(),
        path: "cat".into(),
        args: vec![],
    };
    let (child, channel) = spawn_filter(&def).unwrap();
    let pid = Pid::from_raw(child.id().unwrap() as i32);
    agent.add_filter(def.name.clone(), HookMask::empty(), channel);
    agent.supervise(def.name, child);
    let task = tokio::spawn(agent.run());

    // An answer means the signal handlers are in place.
    let envelope = Envelope {
        session_id: 1,
        ..Default::default()
    };
    smtp.send(ImsgType::MfaConnect.compose(&envelope).unwrap());
    let frame = smtp.recv().await.unwrap().expect("agent hung up");
    assert_eq!(ImsgType::from_tag(frame.tag), Some(ImsgType::MfaConnect));

    raise(Signal::SIGTERM).unwrap();
    tokio::time::timeout(Duration::from_secs(10), task)
        .await
        .expect("agent did not stop")
        .unwrap()
        .unwrap();

    assert_eq!(kill(pid, None), Err(Errno::ESRCH));
    assert!(smtp.recv().await.unwrap().is_none());
}
