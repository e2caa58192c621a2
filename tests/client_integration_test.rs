//! Integration tests for the inverter client against a local simulator
//!
//! Each test starts an in-memory register simulator on a loopback port and
//! drives the public client API end to end: queries, cached reads, write
//! verification, retry behavior, pool identity and idle close.

mod simulators;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use heliolink::config::LinkConfig;
use heliolink::frame::{Command, Datagram};
use heliolink::registry::{
    self, RegisterDesc, RegisterValue, WireType, ID_BATTERY_SOC, ID_BATTERY_STATUS,
    ID_GRID_FREQUENCY,
};
use heliolink::{ConnectOptions, Connection, ConnectionPool, LinkError};

use simulators::inverter_simulator::InverterSimulator;

static TEST_POINTS: [RegisterDesc; 5] = [
    RegisterDesc::new(0x1000_0001, "test.point_a", WireType::Uint16, false),
    RegisterDesc::new(0x1000_0002, "test.point_b", WireType::Uint16, false),
    RegisterDesc::new(0x1000_0003, "test.point_c", WireType::Uint16, false),
    RegisterDesc::new(0x1000_0004, "test.point_d", WireType::Uint16, false),
    RegisterDesc::new(0x1000_0005, "test.point_e", WireType::Uint16, false),
];

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Tight timeouts so failure-path tests stay fast.
fn fast_options() -> ConnectOptions {
    ConnectOptions {
        config: LinkConfig {
            dial_timeout_ms: 2000,
            receive_timeout_ms: 500,
            max_retries: 3,
            initial_backoff_ms: 10,
            backoff_multiplier: 2.0,
            idle_timeout_ms: 60_000,
        },
        cache_ttl: Duration::from_secs(5),
        cache_max: 32,
        ..ConnectOptions::default()
    }
}

async fn start_simulator() -> (Arc<InverterSimulator>, Connection) {
    let (sim, addr) = InverterSimulator::new().start().await;
    let conn = Connection::open(&addr.ip().to_string(), addr.port(), fast_options());
    (sim, conn)
}

// ============================================================================
// Queries and caching
// ============================================================================

#[tokio::test]
async fn test_query_decodes_register_value() {
    init_logging();
    let (sim, conn) = start_simulator().await;
    sim.set_register(ID_BATTERY_SOC, 0.87f32.to_be_bytes().to_vec())
        .await;

    let soc = registry::find_register(ID_BATTERY_SOC).unwrap();
    let value = conn.query(soc).await.unwrap();
    let soc_value = value.as_f64().unwrap();
    assert!((soc_value - 0.87).abs() < 1e-6, "got {soc_value}");
    conn.close().await;
}

#[tokio::test]
async fn test_query_register_with_escaped_id() {
    init_logging();
    let (sim, conn) = start_simulator().await;
    // The grid frequency id contains an escape-token byte, so both the
    // request and the response frames carry escape sequences.
    sim.set_register(ID_GRID_FREQUENCY, 50.02f32.to_be_bytes().to_vec())
        .await;

    let freq = registry::find_register(ID_GRID_FREQUENCY).unwrap();
    let value = conn.query(freq).await.unwrap();
    assert!((value.as_f64().unwrap() - 50.02).abs() < 1e-3);
    conn.close().await;
}

#[tokio::test]
async fn test_repeated_query_is_served_from_cache() {
    init_logging();
    let (sim, conn) = start_simulator().await;
    sim.set_register(ID_BATTERY_SOC, 0.5f32.to_be_bytes().to_vec())
        .await;

    let soc = registry::find_register(ID_BATTERY_SOC).unwrap();
    let first = conn.query(soc).await.unwrap();
    let second = conn.query(soc).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(sim.read_count(), 1, "second read must hit the cache");
    conn.close().await;
}

#[tokio::test]
async fn test_cache_expires_after_ttl() {
    init_logging();
    let (sim, addr_conn) = {
        let (sim, addr) = InverterSimulator::new().start().await;
        let opts = ConnectOptions {
            cache_ttl: Duration::from_millis(50),
            ..fast_options()
        };
        let conn = Connection::open(&addr.ip().to_string(), addr.port(), opts);
        (sim, conn)
    };
    sim.set_register(ID_BATTERY_SOC, 0.5f32.to_be_bytes().to_vec())
        .await;

    let soc = registry::find_register(ID_BATTERY_SOC).unwrap();
    addr_conn.query(soc).await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    addr_conn.query(soc).await.unwrap();
    assert_eq!(sim.read_count(), 2, "expired entry must be re-read");
    addr_conn.close().await;
}

// ============================================================================
// Single-flight serialization
// ============================================================================

#[tokio::test]
async fn test_concurrent_queries_run_in_order_one_at_a_time() {
    init_logging();
    let (sim, conn) = start_simulator().await;
    for (i, point) in TEST_POINTS.iter().enumerate() {
        sim.set_register(point.id, vec![0, i as u8]).await;
    }
    sim.set_response_delay(Duration::from_millis(30));

    let order: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let run = |idx: usize| {
        let conn = conn.clone();
        let order = order.clone();
        async move {
            let value = conn.query(&TEST_POINTS[idx]).await.unwrap();
            order.lock().unwrap().push(idx);
            value
        }
    };

    let started = Instant::now();
    let results = tokio::join!(run(0), run(1), run(2), run(3), run(4));
    let elapsed = started.elapsed();

    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    assert_eq!(results.0, RegisterValue::Integer(0));
    assert_eq!(results.4, RegisterValue::Integer(4));
    assert_eq!(sim.max_overlap(), 1, "more than one request in flight");
    assert!(
        elapsed >= Duration::from_millis(150),
        "requests overlapped: {elapsed:?}"
    );
    conn.close().await;
}

// ============================================================================
// Fault handling
// ============================================================================

#[tokio::test]
async fn test_unsolicited_frames_are_discarded() {
    init_logging();
    let (sim, conn) = start_simulator().await;
    sim.set_register(ID_BATTERY_SOC, 0.25f32.to_be_bytes().to_vec())
        .await;
    sim.emit_unsolicited_before_responses(Datagram::new(Command::Write, 0x1122_3344, vec![]))
        .await;

    let soc = registry::find_register(ID_BATTERY_SOC).unwrap();
    let value = conn.query(soc).await.unwrap();
    assert!((value.as_f64().unwrap() - 0.25).abs() < 1e-6);
    assert!(conn.unsolicited_frames() >= 1);
    conn.close().await;
}

#[tokio::test]
async fn test_corrupted_response_is_retried() {
    init_logging();
    let (sim, conn) = start_simulator().await;
    sim.set_register(ID_BATTERY_SOC, 0.75f32.to_be_bytes().to_vec())
        .await;
    sim.corrupt_first_response_of(ID_BATTERY_SOC).await;

    let soc = registry::find_register(ID_BATTERY_SOC).unwrap();
    let value = conn.query(soc).await.unwrap();
    assert!((value.as_f64().unwrap() - 0.75).abs() < 1e-6);
    assert_eq!(sim.read_count(), 2, "first attempt must be retried");
    conn.close().await;
}

#[tokio::test]
async fn test_receive_timeout_exhausts_retry_budget() {
    init_logging();
    let (sim, addr) = InverterSimulator::new().start().await;
    let opts = ConnectOptions {
        config: LinkConfig {
            receive_timeout_ms: 100,
            max_retries: 2,
            initial_backoff_ms: 10,
            ..fast_options().config
        },
        ..fast_options()
    };
    let conn = Connection::open(&addr.ip().to_string(), addr.port(), opts);
    sim.drop_requests_for(ID_BATTERY_SOC).await;

    let soc = registry::find_register(ID_BATTERY_SOC).unwrap();
    let started = Instant::now();
    let err = conn.query(soc).await.unwrap_err();
    let elapsed = started.elapsed();

    match err {
        LinkError::RetriesExhausted { attempts, source } => {
            assert_eq!(attempts, 2);
            assert!(matches!(*source, LinkError::Timeout(_)));
        },
        other => panic!("expected exhaustion, got {other}"),
    }
    assert!(elapsed >= Duration::from_millis(200), "timed out too early");
    assert_eq!(sim.read_count(), 2);
    conn.close().await;
}

#[tokio::test]
async fn test_connection_refused_is_terminal() {
    init_logging();
    // Grab a loopback port with no listener behind it.
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let conn = Connection::open("127.0.0.1", port, fast_options());
    let soc = registry::find_register(ID_BATTERY_SOC).unwrap();
    let started = Instant::now();
    let err = conn.query(soc).await.unwrap_err();

    assert!(matches!(err, LinkError::Connection(_)), "got {err}");
    assert!(!err.is_recoverable());
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "dial failure must not be retried"
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!conn.is_open(), "dial failure must close the connection");
}

// ============================================================================
// Writes
// ============================================================================

#[tokio::test]
async fn test_write_stores_and_verifies_value() {
    init_logging();
    let (sim, conn) = start_simulator().await;
    sim.set_register(ID_BATTERY_STATUS, vec![0]).await;

    let brightness = registry::find_register_by_label("display.brightness").unwrap();
    conn.write(brightness, 200i64).await.unwrap();

    assert_eq!(sim.get_register(brightness.id).await, Some(vec![200]));
    assert_eq!(sim.write_count(), 1);
    // One readiness probe plus one verification read.
    assert_eq!(sim.read_count(), 2);
    conn.close().await;
}

#[tokio::test]
async fn test_write_refused_when_device_not_ready() {
    init_logging();
    let (sim, conn) = start_simulator().await;
    sim.set_register(ID_BATTERY_STATUS, vec![3]).await;

    let brightness = registry::find_register_by_label("display.brightness").unwrap();
    let err = conn.write(brightness, 10i64).await.unwrap_err();

    assert!(matches!(err, LinkError::DeviceNotReady { status: 3 }));
    assert_eq!(err.code(), "E_DEVICE_NOT_READY");
    assert_eq!(sim.write_count(), 0, "write must not reach the device");
    assert_eq!(sim.read_count(), 1, "not-ready must not be retried");
    conn.close().await;
}

#[tokio::test]
async fn test_write_to_readonly_register_fails_without_io() {
    init_logging();
    let (sim, conn) = start_simulator().await;

    let soc = registry::find_register(ID_BATTERY_SOC).unwrap();
    let err = conn.write(soc, 0.5f64).await.unwrap_err();
    assert!(matches!(err, LinkError::NotWritable(_)));
    assert_eq!(sim.read_count(), 0);
    conn.close().await;
}

#[tokio::test]
async fn test_write_rejected_by_validation_predicate() {
    init_logging();
    let (sim, conn) = start_simulator().await;

    let target = registry::find_register_by_label("battery.soc_target").unwrap();
    let err = conn.write(target, 1.5f64).await.unwrap_err();
    assert!(matches!(err, LinkError::InvalidArgument(_)));
    assert_eq!(sim.read_count(), 0);
    conn.close().await;
}

#[tokio::test]
async fn test_write_verification_mismatch_exhausts_retries() {
    init_logging();
    let (sim, addr) = InverterSimulator::new().start().await;
    let opts = ConnectOptions {
        config: LinkConfig {
            max_retries: 2,
            initial_backoff_ms: 10,
            ..fast_options().config
        },
        ..fast_options()
    };
    let conn = Connection::open(&addr.ip().to_string(), addr.port(), opts);
    sim.set_register(ID_BATTERY_STATUS, vec![0]).await;

    let brightness = registry::find_register_by_label("display.brightness").unwrap();
    sim.set_register(brightness.id, vec![5]).await;
    sim.set_ignore_writes(true);

    let err = conn.write(brightness, 200i64).await.unwrap_err();
    match err {
        LinkError::RetriesExhausted { attempts, source } => {
            assert_eq!(attempts, 2);
            assert!(matches!(*source, LinkError::ResponseMismatch(_)));
        },
        other => panic!("expected exhaustion, got {other}"),
    }
    assert_eq!(sim.write_count(), 2);
    assert_eq!(sim.get_register(brightness.id).await, Some(vec![5]));
    conn.close().await;
}

// ============================================================================
// Pool and lifecycle
// ============================================================================

#[tokio::test]
async fn test_pool_shares_one_connection_per_key() {
    init_logging();
    let (sim, addr) = InverterSimulator::new().start().await;
    sim.set_register(ID_BATTERY_SOC, 0.5f32.to_be_bytes().to_vec())
        .await;
    let host = addr.ip().to_string();

    let pool = ConnectionPool::new();
    let first = pool.get(&host, addr.port(), Duration::from_secs(5), 32);
    let second = pool.get(&host, addr.port(), Duration::from_secs(5), 32);

    let soc = registry::find_register(ID_BATTERY_SOC).unwrap();
    first.query(soc).await.unwrap();
    second.query(soc).await.unwrap();
    // Both handles share one instance, so the second query hits its cache.
    assert_eq!(sim.read_count(), 1);

    first.close().await;
    assert!(!second.is_open(), "handles share the closed instance");

    let replacement = pool.get(&host, addr.port(), Duration::from_secs(5), 32);
    assert!(replacement.is_open());
    // Fresh instance: fresh cache, so the read goes to the wire again.
    replacement.query(soc).await.unwrap();
    assert_eq!(sim.read_count(), 2);

    pool.shutdown().await;
}

#[tokio::test]
async fn test_idle_connection_closes_itself() {
    init_logging();
    let (sim, addr) = InverterSimulator::new().start().await;
    sim.set_register(ID_BATTERY_SOC, 0.5f32.to_be_bytes().to_vec())
        .await;
    let opts = ConnectOptions {
        config: LinkConfig {
            idle_timeout_ms: 100,
            ..fast_options().config
        },
        ..fast_options()
    };
    let conn = Connection::open(&addr.ip().to_string(), addr.port(), opts);

    let soc = registry::find_register(ID_BATTERY_SOC).unwrap();
    conn.query(soc).await.unwrap();
    assert!(conn.is_open());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!conn.is_open(), "idle connection must close itself");

    let err = conn.query(soc).await.unwrap_err();
    assert!(matches!(err, LinkError::NotConnected));
}
