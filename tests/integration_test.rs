use orc_bus::bus::{MODULE_LOAD, MODULE_RELOAD, MODULE_UNLOAD, SHUTDOWN};
use orc_bus::config::RunRecord;
use orc_bus::commander::NoPeers;
use orc_bus::executor::DELAYED_SPACING;
use orc_bus::notifier::{Notification, TOKEN_CHANGED};
use orc_bus::transport::{encode_line, Endpoint};
use orc_bus::*;
use serde_json::{json, Value};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::LocalSet;
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};

const TOKEN: &str = "integration-token";

type Spans = Rc<RefCell<Vec<(String, Instant, Instant)>>>;

/// `math.add` takes 10ms and is serialized; `math.slow` is delayed.
struct Math {
    spans: Spans,
}

impl BusModule for Math {
    fn version(&self) -> &str {
        "2.0.0"
    }

    fn commands(&self) -> Result<ModuleCommands, BusError> {
        let add_spans = Rc::clone(&self.spans);
        let slow_spans = Rc::clone(&self.spans);
        Ok(ModuleCommands::new()
            .command(
                "add",
                CommandPolicy {
                    desc: Some("add a and b".into()),
                    activity: true,
                    parallel: false,
                    ..Default::default()
                },
                Handler::task(move |msg, resp| {
                    let spans = Rc::clone(&add_spans);
                    async move {
                        let start = Instant::now();
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        let a = msg.data["a"].as_i64().unwrap_or(0);
                        let b = msg.data["b"].as_i64().unwrap_or(0);
                        resp.finished(json!(a + b));
                        spans
                            .borrow_mut()
                            .push((format!("add {}", a + b), start, Instant::now()));
                        Ok(())
                    }
                }),
            )
            .command(
                "slow",
                CommandPolicy {
                    activity: false,
                    delayed: true,
                    ..Default::default()
                },
                Handler::sync(move |msg, resp| {
                    let now = Instant::now();
                    let label = msg.data.as_str().unwrap_or("slow").to_string();
                    slow_spans.borrow_mut().push((label, now, now));
                    resp.finished(Value::Null);
                    Ok(())
                }),
            )
            .command(
                "fast",
                CommandPolicy::builtin("immediate"),
                Handler::sync(|_, resp| {
                    resp.finished(Value::Null);
                    Ok(())
                }),
            ))
    }
}

fn catalog(spans: &Spans) -> ModuleCatalog {
    let spans = Rc::clone(spans);
    let mut catalog = ModuleCatalog::new();
    catalog.provide("math", move || {
        Ok(Rc::new(Math {
            spans: Rc::clone(&spans),
        }) as Rc<dyn BusModule>)
    });
    catalog
}

fn bus(spans: &Spans) -> Bus {
    Bus::new(BusConfig::default(), catalog(spans), Rc::new(NoPeers), TOKEN).unwrap()
}

fn msg(data: Value) -> Message {
    Message::new("", data).with_token(TOKEN).with_orc_name("tester")
}

fn drain(rx: &mut broadcast::Receiver<Notification>) -> Vec<Notification> {
    let mut out = Vec::new();
    while let Ok(n) = rx.try_recv() {
        out.push(n);
    }
    out
}

fn with_topic<'a>(events: &'a [Notification], topic: &str) -> Vec<&'a Notification> {
    events.iter().filter(|n| n.topic == topic).collect()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

/// Load math, run two serialized adds, unload, then hit the error path
#[tokio::test(start_paused = true)]
async fn test_math_scenario() {
    LocalSet::new()
        .run_until(async {
            let spans: Spans = Rc::default();
            let bus = bus(&spans);
            let mut rx = bus.commander().notifier().subscribe();

            bus.handle(MODULE_LOAD, msg(json!({"file": "math", "path": "/modules"})));
            settle().await;
            assert!(bus.commander().is_command_registered("math.add"));

            bus.handle("math.add", msg(json!({"a": 1, "b": 2})));
            bus.handle("math.add", msg(json!({"a": 10, "b": 20})));
            settle().await;

            {
                let spans = spans.borrow();
                assert_eq!(spans.len(), 2);
                assert_eq!(spans[0].0, "add 3");
                assert_eq!(spans[1].0, "add 30");
                // second start is not before the first response
                assert!(spans[1].1 >= spans[0].2);
            }
            let events = drain(&mut rx);
            let results: Vec<&Value> = with_topic(&events, "tester::math.add.finished")
                .into_iter()
                .map(|n| &n.payload)
                .collect();
            assert_eq!(results, vec![&json!(3), &json!(30)]);

            bus.handle(MODULE_UNLOAD, msg(json!({"name": "math"})));
            settle().await;
            assert!(!bus.commander().is_module_registered("math"));

            bus.handle("math.add", msg(json!({"a": 1, "b": 2})));
            settle().await;
            let events = drain(&mut rx);
            let errors = with_topic(&events, "tester::math.add.error");
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].payload["cmd"], "math.add");
            assert_eq!(errors[0].payload["data"]["b"], 2);
        })
        .await;
}

/// Every unserved command yields its own error
#[tokio::test(start_paused = true)]
async fn test_unavailable_twice() {
    LocalSet::new()
        .run_until(async {
            let bus = bus(&Spans::default());
            let mut rx = bus.commander().notifier().subscribe();

            bus.handle("ghost.walk", msg(json!(1)));
            bus.handle("ghost.walk", msg(json!(2)));
            settle().await;

            let events = drain(&mut rx);
            let errors = with_topic(&events, "tester::ghost.walk.error");
            assert_eq!(errors.len(), 2);
            assert_eq!(errors[0].payload["data"], 1);
            assert_eq!(errors[1].payload["data"], 2);
        })
        .await;
}

/// Lane 0 drains before lane 1; lane 1 keeps its spacing
#[tokio::test(start_paused = true)]
async fn test_delayed_commands_yield() {
    LocalSet::new()
        .run_until(async {
            let spans: Spans = Rc::default();
            let bus = bus(&spans);
            let resp = Response::greathall(bus.commander().clone(), MODULE_LOAD);
            bus.modules()
                .load(Some(&resp), &["math".to_string()], "/modules".as_ref(), false)
                .await
                .unwrap();

            for label in ["s1", "s2", "s3"] {
                bus.handle("math.slow", msg(json!(label)));
            }
            let mut rx = bus.commander().notifier().subscribe();
            bus.handle("math.fast", msg(Value::Null));
            settle().await;

            let spans = spans.borrow();
            let labels: Vec<&str> = spans.iter().map(|s| s.0.as_str()).collect();
            assert_eq!(labels, vec!["s1", "s2", "s3"]);
            for pair in spans.windows(2) {
                assert!(pair[1].1.duration_since(pair[0].1) >= DELAYED_SPACING);
            }
            // the immediate command did not wait behind the delayed lane
            let events = drain(&mut rx);
            let fast = events
                .iter()
                .position(|n| n.topic == "tester::math.fast.finished")
                .unwrap();
            let last_slow = events
                .iter()
                .rposition(|n| n.topic == "tester::math.slow.finished")
                .unwrap();
            assert!(fast < last_slow);
        })
        .await;
}

/// Old token rejected, new token accepted
#[tokio::test(start_paused = true)]
async fn test_token_rotation() {
    LocalSet::new()
        .run_until(async {
            let bus = bus(&Spans::default());
            let mut rx = bus.commander().notifier().subscribe();

            let token = bus.rotate_token();
            bus.handle("motd", msg(Value::Null));
            bus.handle("motd", msg(Value::Null).with_token(token.clone()));
            settle().await;

            let events = drain(&mut rx);
            assert_eq!(with_topic(&events, TOKEN_CHANGED)[0].payload["token"], json!(token));
            assert_eq!(with_topic(&events, "tester::motd.finished").len(), 1);
        })
        .await;
}

/// Reload keeps the hot flag of each module
#[tokio::test(start_paused = true)]
async fn test_reload_keeps_hot_flag() {
    LocalSet::new()
        .run_until(async {
            let bus = bus(&Spans::default());
            bus.handle(
                MODULE_LOAD,
                msg(json!({"file": "math", "path": "/modules", "hot": true})),
            );
            settle().await;
            let before = bus.modules().record("math").unwrap();

            bus.handle(MODULE_RELOAD, msg(json!({"file": "math", "path": "/modules"})));
            settle().await;

            let after = bus.modules().record("math").unwrap();
            assert!(after.hot);
            assert_eq!(after, before);
            let location = before.location.clone();
            assert_eq!(bus.modules().catalog().generation(&location), 2);
            assert_eq!(bus.modules().running_module_locations(true), vec![location]);
        })
        .await;
}

async fn read_until(lines: &mut tokio::io::Lines<BufReader<TcpStream>>, topic: &str) -> Notification {
    loop {
        let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let notification: Notification = serde_json::from_str(&line).unwrap();
        if notification.topic == topic {
            return notification;
        }
    }
}

fn tcp(endpoint: &Endpoint) -> std::net::SocketAddr {
    match endpoint {
        Endpoint::Tcp(addr) => *addr,
        Endpoint::Unix(path) => panic!("unexpected unix socket {}", path.display()),
    }
}

/// Full boot over real sockets: autoconnect, command, shutdown
#[tokio::test]
async fn test_boot_over_sockets() {
    LocalSet::new()
        .run_until(async {
            let run_dir = tempfile::tempdir().unwrap();
            let config = BusConfig {
                commander_port: 0,
                notifier_port: 0,
                heartbeat_ms: 0,
                run_dir: run_dir.path().to_path_buf(),
                modules: vec![config::ModulePathConfig {
                    path: "/modules".into(),
                    pattern: "^math$".into(),
                    hot: false,
                }],
                ..Default::default()
            };
            let spans: Spans = Rc::default();
            let (bus, inbound) = assert_ok!(Bus::boot(config, catalog(&spans)).await);
            assert!(bus.commander().is_command_registered("math.add"));

            let record = assert_ok!(RunRecord::load(run_dir.path()));
            let (commander, notifier) = bus.endpoints().unwrap();
            assert_eq!(record.commander_port, tcp(&commander).port());
            assert_eq!(record.notifier_port, tcp(&notifier).port());

            let subscribers = bus.commander().notifier().subscriber_count();
            let mut events = BufReader::new(TcpStream::connect(tcp(&notifier)).await.unwrap()).lines();
            let mut commands = TcpStream::connect(tcp(&commander)).await.unwrap();
            while bus.commander().notifier().subscriber_count() == subscribers {
                tokio::task::yield_now().await;
            }

            let bus = Rc::new(bus);
            let running = {
                let bus = Rc::clone(&bus);
                tokio::task::spawn_local(async move { bus.run(inbound).await })
            };

            let hello = Envelope::new("autoconnect", Message::new("autoconnect", json!("tester")));
            commands.write_all(&encode_line(&hello).unwrap()).await.unwrap();
            let welcome = read_until(&mut events, "tester::autoconnect.finished").await;
            let token = welcome.payload["token"].as_str().unwrap().to_string();
            assert_eq!(token, bus.token());
            assert!(welcome.payload["commands"]["math.add"].is_object());

            let add = Envelope::new(
                "math.add",
                Message::new("math.add", json!({"a": 2, "b": 3}))
                    .with_token(token.clone())
                    .with_orc_name("tester"),
            );
            commands.write_all(&encode_line(&add).unwrap()).await.unwrap();
            let result = read_until(&mut events, "tester::math.add.finished").await;
            assert_eq!(result.payload, json!(5));

            let stop = Envelope::new(
                SHUTDOWN,
                Message::new(SHUTDOWN, Value::Null)
                    .with_token(token)
                    .with_orc_name("tester"),
            );
            commands.write_all(&encode_line(&stop).unwrap()).await.unwrap();
            assert_ok!(tokio::time::timeout(Duration::from_secs(5), running).await);

            bus.stop().await;
            read_until(&mut events, "gameover").await;
            assert!(bus.endpoints().is_none());
        })
        .await;
}

/// A second bus on the same ports moves to the next free ones
#[tokio::test]
async fn test_boot_twice_moves_ports() {
    LocalSet::new()
        .run_until(async {
            let run_dir = tempfile::tempdir().unwrap();
            let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = taken.local_addr().unwrap().port();
            let config = BusConfig {
                commander_port: port,
                notifier_port: 0,
                heartbeat_ms: 0,
                run_dir: run_dir.path().to_path_buf(),
                ..Default::default()
            };

            let (bus, _inbound) = assert_ok!(Bus::boot(config, ModuleCatalog::new()).await);
            let (commander, _) = bus.endpoints().unwrap();
            assert!(tcp(&commander).port() > port);
            bus.stop().await;
        })
        .await;
}

/// Unloading a module nobody loaded is a no-op; bad arguments are reported
#[tokio::test(start_paused = true)]
async fn test_module_command_arguments() {
    LocalSet::new()
        .run_until(async {
            let bus = bus(&Spans::default());
            let mut rx = bus.commander().notifier().subscribe();

            bus.handle(MODULE_UNLOAD, msg(json!({"name": "math"})));
            bus.handle(MODULE_LOAD, msg(json!({"path": "/modules"})));
            settle().await;

            let events = drain(&mut rx);
            assert_eq!(
                with_topic(&events, "tester::bus.module.unload.finished")[0].payload["unloaded"],
                json!([])
            );
            assert_eq!(with_topic(&events, "tester::bus.module.load.error").len(), 1);

            let nested = Response::greathall(bus.commander().clone(), "tester.call");
            assert_err!(nested.command("math.add", Value::Null).await);
        })
        .await;
}
