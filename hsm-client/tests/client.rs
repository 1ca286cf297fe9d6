use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use hsm_client::{
    CancelToken, ClientConfig, ClientError, HsmClient, PoolSettings, PoolStatus,
};
use serde_json::json;

type Responder = dyn Fn(usize, &[u8]) -> Option<Vec<u8>> + Send + Sync;

/// Fake HSM: records every request frame and answers with whatever the
/// responder returns. `None` leaves the request unanswered.
struct FakeHsm {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl FakeHsm {
    fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().unwrap().clone()
    }
}

fn spawn_hsm<F>(responder: F) -> FakeHsm
where
    F: Fn(usize, &[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    let requests = Arc::new(Mutex::new(Vec::new()));
    let responder: Arc<Responder> = Arc::new(responder);

    let recorded = requests.clone();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { break };
            let recorded = recorded.clone();
            let responder = responder.clone();
            thread::spawn(move || serve_connection(stream, recorded, responder));
        }
    });

    FakeHsm { addr, requests }
}

fn serve_connection(
    mut stream: TcpStream,
    recorded: Arc<Mutex<Vec<Vec<u8>>>>,
    responder: Arc<Responder>,
) {
    loop {
        let mut header = [0u8; 4];
        if stream.read_exact(&mut header).is_err() {
            return;
        }
        let len = usize::from_str_radix(std::str::from_utf8(&header).expect("ascii"), 16)
            .expect("hex header");
        let mut body = vec![0u8; len];
        if stream.read_exact(&mut body).is_err() {
            return;
        }

        let idx = {
            let mut requests = recorded.lock().unwrap();
            let mut frame = header.to_vec();
            frame.extend_from_slice(&body);
            requests.push(frame);
            requests.len() - 1
        };
        if let Some(reply) = responder(idx, &body) {
            if stream.write_all(&reply).is_err() {
                return;
            }
            let _ = stream.flush();
        }
    }
}

fn test_config(addr: SocketAddr, pool_size: usize) -> ClientConfig {
    ClientConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        timeout_ms: 1_000,
        connect_timeout_ms: 1_000,
        header_length: 4,
        max_retries: 3,
        retry_base_delay_ms: 20,
        pool: PoolSettings {
            min_size: 1,
            max_size: pool_size,
            max_idle_time_ms: 300_000,
            max_age_ms: 1_800_000,
            borrow_timeout_ms: 500,
        },
    }
}

fn client_with(config: ClientConfig) -> HsmClient {
    HsmClient::with_factory(&config, config.connector())
}

#[test]
fn warm_up_reports_full_pool() {
    let hsm = spawn_hsm(|_, _| Some(b"0004ND00".to_vec()));
    let client = HsmClient::connect(test_config(hsm.addr, 5)).expect("client");
    assert_eq!(
        client.pool_status(),
        PoolStatus {
            capacity: 5,
            available: 5,
            borrowed: 0
        }
    );
}

#[test]
fn send_command_frames_request_and_keeps_header() {
    let hsm = spawn_hsm(|_, body| {
        assert_eq!(body, b"NC");
        Some(b"000CNP00DEADBEEF".to_vec())
    });
    let client = HsmClient::connect(test_config(hsm.addr, 2)).expect("client");

    let response = client.send_command("NC").expect("send");
    assert_eq!(response.as_str(), "000CNP00DEADBEEF");
    let fields = response.fields().expect("fields");
    assert_eq!(fields.response_code, "NP");
    assert_eq!(fields.error_code, "00");
    assert_eq!(fields.payload, "DEADBEEF");

    assert_eq!(hsm.requests(), vec![b"0002NC".to_vec()]);
    assert_eq!(client.pool_status().borrowed, 0);
}

#[test]
fn test_connection_requires_nd_and_zero_error() {
    for (reply, expected) in [
        (&b"0004ND00"[..], true),
        (&b"0014ND002668613500000000"[..], true),
        (&b"0004ND15"[..], false),
        (&b"0004NP00"[..], false),
        (&b"0002ND"[..], false),
    ] {
        let hsm = spawn_hsm(move |_, _| Some(reply.to_vec()));
        let client = HsmClient::connect(test_config(hsm.addr, 1)).expect("client");
        assert_eq!(client.test_connection(), expected, "reply {:?}", reply);
    }
}

#[test]
fn health_report_serializes_like_the_endpoint() {
    let hsm = spawn_hsm(|_, _| Some(b"0004ND00".to_vec()));
    let client = HsmClient::connect(test_config(hsm.addr, 1)).expect("client");
    assert_eq!(
        serde_json::to_value(client.health()).unwrap(),
        json!({ "connected": true, "status": "UP", "message": "HSM is healthy" })
    );
}

#[test]
fn test_connection_is_false_when_hsm_is_down() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let mut config = test_config(addr, 2);
    config.pool.borrow_timeout_ms = 20;
    let client = HsmClient::connect(config).expect("client");
    assert_eq!(client.pool_status().available, 0);
    assert!(!client.test_connection());
    assert_eq!(client.health().status, "DOWN");
}

#[test]
fn generate_random_hex_returns_payload() {
    let hsm = spawn_hsm(|_, body| {
        assert_eq!(body, b"NOX016");
        Some(b"0014NP000123456789ABCDEF".to_vec())
    });
    let client = HsmClient::connect(test_config(hsm.addr, 1)).expect("client");
    assert_eq!(client.generate_random_hex(16).unwrap(), "0123456789ABCDEF");
}

#[test]
fn generate_random_hex_surfaces_device_errors() {
    let hsm = spawn_hsm(|idx, _| match idx {
        0 => Some(b"0004NP12".to_vec()),
        _ => Some(b"0004NQ00".to_vec()),
    });
    let client = HsmClient::connect(test_config(hsm.addr, 1)).expect("client");

    match client.generate_random_hex(8) {
        Err(ClientError::Device { code }) => assert_eq!(code, "12"),
        other => panic!("unexpected result: {:?}", other),
    }
    match client.generate_random_hex(8) {
        Err(ClientError::UnexpectedResponse { expected, actual }) => {
            assert_eq!(expected, "NP");
            assert_eq!(actual, "NQ");
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[test]
fn transport_failures_back_off_then_exhaust() {
    // Never answers: every attempt hits the socket read timeout.
    let hsm = spawn_hsm(|_, _| None);
    let mut config = test_config(hsm.addr, 1);
    config.timeout_ms = 100;
    config.retry_base_delay_ms = 200;
    let client = client_with(config);

    let started = Instant::now();
    let err = client.send_command("NC").err().expect("must fail");
    let elapsed = started.elapsed();

    match err {
        ClientError::RetriesExhausted { attempts, last } => {
            assert_eq!(attempts, 3);
            assert!(matches!(*last, ClientError::Transport(_)), "last: {:?}", last);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    // Three 100ms read timeouts plus sleeps of 200ms and 400ms, but no third sleep.
    assert!(elapsed >= Duration::from_millis(850), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1450), "elapsed {:?}", elapsed);
    assert_eq!(hsm.requests().len(), 3);
}

#[test]
fn protocol_failure_is_retried_on_a_fresh_connection() {
    let hsm = spawn_hsm(|idx, _| match idx {
        0 => Some(b"XXXX".to_vec()),
        _ => Some(b"0004ND00".to_vec()),
    });
    let client = HsmClient::connect(test_config(hsm.addr, 1)).expect("client");

    let response = client.send_command("NC").expect("second attempt succeeds");
    assert_eq!(response.as_str(), "0004ND00");
    assert_eq!(hsm.requests().len(), 2);
    assert_eq!(
        client.pool_status(),
        PoolStatus {
            capacity: 1,
            available: 1,
            borrowed: 0
        }
    );
}

#[test]
fn invalid_length_response_is_not_reused() {
    let hsm = spawn_hsm(|idx, _| match idx {
        // Header announces 0 bytes; the trailing bytes must not leak into the next read.
        0 => Some(b"0000ND00".to_vec()),
        _ => Some(b"0004ND00".to_vec()),
    });
    let client = HsmClient::connect(test_config(hsm.addr, 1)).expect("client");
    assert_eq!(client.send_command("NC").unwrap().as_str(), "0004ND00");
    assert_eq!(client.send_command("NC").unwrap().as_str(), "0004ND00");
}

#[test]
fn unencodable_command_is_not_sent() {
    let hsm = spawn_hsm(|_, _| Some(b"0004ND00".to_vec()));
    let client = HsmClient::connect(test_config(hsm.addr, 1)).expect("client");

    let err = client.send_command(&"A".repeat(70_000)).err().expect("must fail");
    assert!(matches!(err, ClientError::Encoding(_)));
    assert!(hsm.requests().is_empty());
}

#[test]
fn cancellation_during_backoff_stops_retrying() {
    let hsm = spawn_hsm(|_, _| Some(b"XXXX".to_vec()));
    let mut config = test_config(hsm.addr, 1);
    config.retry_base_delay_ms = 5_000;
    let client = client_with(config);

    let token = CancelToken::new();
    let remote = token.clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        remote.cancel();
    });

    let started = Instant::now();
    let err = client
        .send_command_cancellable("NC", &token)
        .err()
        .expect("must fail");
    canceller.join().unwrap();

    assert!(matches!(err, ClientError::Cancelled), "err: {:?}", err);
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(hsm.requests().len(), 1);
}

#[test]
fn shutdown_rejects_further_commands() {
    let hsm = spawn_hsm(|_, _| Some(b"0004ND00".to_vec()));
    let client = HsmClient::connect(test_config(hsm.addr, 3)).expect("client");
    client.send_command("NC").expect("send");

    client.shutdown();
    client.shutdown();
    assert!(matches!(client.send_command("NC"), Err(ClientError::PoolClosed)));
    assert_eq!(
        client.pool_status(),
        PoolStatus {
            capacity: 3,
            available: 0,
            borrowed: 0
        }
    );
}

#[test]
fn concurrent_callers_share_the_pool() {
    let hsm = spawn_hsm(|_, body| {
        // Echo the command code back as the payload.
        let mut reply = format!("{:04X}ND00", body.len() + 4).into_bytes();
        reply.extend_from_slice(body);
        Some(reply)
    });
    let mut config = test_config(hsm.addr, 3);
    config.pool.borrow_timeout_ms = 5_000;
    let client = Arc::new(HsmClient::connect(config).expect("client"));

    let workers: Vec<_> = (0..8)
        .map(|worker| {
            let client = client.clone();
            thread::spawn(move || {
                for i in 0..10 {
                    let command = format!("EC{:02}{:02}", worker, i);
                    let response = client.send_command(&command).expect("send");
                    assert_eq!(response.fields().unwrap().payload, command);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(hsm.requests().len(), 80);
    let status = client.pool_status();
    assert_eq!(status.borrowed, 0);
    assert_eq!(status.available, 3);
}

#[test]
fn connect_rejects_invalid_config() {
    let mut config = ClientConfig::default();
    config.max_retries = 0;
    assert!(matches!(HsmClient::connect(config), Err(ClientError::Config(_))));
}
