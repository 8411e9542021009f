//! End-to-end scenarios for the NTRIP caster, driving real `TcpStream`
//! pairs over ephemeral loopback ports rather than mocking the protocol
//! layer.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use ntrip_caster::geocode::{NullReverseGeocoder, ReverseGeocoder};
use ntrip_caster::{Catalog, Config, FanoutEngine, Registry, SourcetableCache};

async fn spawn_caster(catalog: Catalog) -> (std::net::SocketAddr, Arc<ntrip_caster::Caster>, CancellationToken) {
    spawn_caster_with_geocoder(catalog, Arc::new(NullReverseGeocoder), |_| {}).await
}

/// Like [`spawn_caster`] but lets the test tweak the default config before
/// the caster's components are built from it.
async fn spawn_caster_with(
    catalog: Catalog,
    configure: impl FnOnce(&mut Config),
) -> (std::net::SocketAddr, Arc<ntrip_caster::Caster>, CancellationToken) {
    spawn_caster_with_geocoder(catalog, Arc::new(NullReverseGeocoder), configure).await
}

async fn spawn_caster_with_geocoder(
    catalog: Catalog,
    geocoder: Arc<dyn ReverseGeocoder>,
    configure: impl FnOnce(&mut Config),
) -> (std::net::SocketAddr, Arc<ntrip_caster::Caster>, CancellationToken) {
    let mut config = Config::default();
    config.ring_buffer_size = 4;
    config.data_send_timeout_secs = 1;
    configure(&mut config);

    let registry = Arc::new(Registry::new(config.max_user_connections_per_mount));
    let fanout = Arc::new(FanoutEngine::new(registry.clone(), config.data_send_timeout()));
    let sourcetable = Arc::new(SourcetableCache::new(
        PathBuf::from(std::env::temp_dir().join(format!("mount_list_{:p}.txt", &registry))),
        config.app.clone(),
        config.caster.clone(),
        config.host.clone(),
        config.ntrip_port,
    ));

    let caster = Arc::new(ntrip_caster::Caster {
        config: Arc::new(config),
        catalog: Arc::new(catalog),
        registry,
        fanout,
        sourcetable,
        geocoder,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();

    let serve_caster = caster.clone();
    let serve_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = ntrip_caster::protocol::serve(serve_caster, listener, serve_shutdown).await;
    });

    (addr, caster, shutdown)
}

async fn read_available(stream: &mut TcpStream, max: usize) -> Vec<u8> {
    let mut buf = vec![0u8; max];
    tokio::time::sleep(Duration::from_millis(50)).await;
    match tokio::time::timeout(Duration::from_millis(200), stream.read(&mut buf)).await {
        Ok(Ok(n)) => buf[..n].to_vec(),
        _ => Vec::new(),
    }
}

/// Scenario 1: a v1.0 uploader pushes bytes, a v1.0 subscriber joining
/// afterward receives the tail of what's buffered.
#[tokio::test]
async fn v1_upload_and_subscribe() {
    let catalog = Catalog::open(":memory:", "admin", "adminpw").unwrap();
    catalog.add_user("alice", "pw").unwrap();
    catalog.add_mount("MT01", "secret", None).unwrap();
    let (addr, caster, shutdown) = spawn_caster(catalog).await;

    let mut uploader = TcpStream::connect(addr).await.unwrap();
    uploader.write_all(b"SOURCE secret MT01\r\n").await.unwrap();
    let mut resp = [0u8; 32];
    let n = uploader.read(&mut resp).await.unwrap();
    assert_eq!(&resp[..n], b"ICY 200 OK\r\n");
    uploader.write_all(b"AABBCC").await.unwrap();

    // give the uploader's read loop a moment to ingest before subscribing
    tokio::time::sleep(Duration::from_millis(20)).await;

    let creds = ntrip_caster::protocol::auth::encode_basic_auth("alice", "pw");
    let mut subscriber = TcpStream::connect(addr).await.unwrap();
    subscriber
        .write_all(format!("GET /MT01 HTTP/1.0\r\nAuthorization: {creds}\r\n\r\n").as_bytes())
        .await
        .unwrap();

    caster.fanout.broadcast_tick().await;

    let received = read_available(&mut subscriber, 256).await;
    let text = String::from_utf8_lossy(&received);
    assert!(text.starts_with("ICY 200 OK\r\n"));
    assert!(text.contains("AABBCC") || text.ends_with("BBCC"));

    shutdown.cancel();
}

/// Scenario 2: a v2.0 subscriber receives each uploaded frame wrapped in
/// hex-length-prefixed chunked framing.
#[tokio::test]
async fn v2_subscribe_chunking() {
    let catalog = Catalog::open(":memory:", "admin", "adminpw").unwrap();
    catalog.add_user("bob", "pw").unwrap();
    catalog.add_mount("MT02", "secret", None).unwrap();
    let (addr, caster, shutdown) = spawn_caster(catalog).await;

    let mut uploader = TcpStream::connect(addr).await.unwrap();
    uploader.write_all(b"SOURCE /MT02 HTTP/1.1\r\n\r\n").await.unwrap();
    let mut resp = [0u8; 64];
    let n = uploader.read(&mut resp).await.unwrap();
    assert!(String::from_utf8_lossy(&resp[..n]).starts_with("HTTP/1.1 200 OK"));

    let creds = ntrip_caster::protocol::auth::encode_basic_auth("bob", "pw");
    let mut subscriber = TcpStream::connect(addr).await.unwrap();
    subscriber
        .write_all(
            format!(
                "GET /MT02 HTTP/1.1\r\nAuthorization: {creds}\r\nNtrip-Version: Ntrip/2.0\r\n\r\n"
            )
            .as_bytes(),
        )
        .await
        .unwrap();
    let mut resp = [0u8; 256];
    let n = subscriber.read(&mut resp).await.unwrap();
    assert!(String::from_utf8_lossy(&resp[..n]).starts_with("HTTP/1.1 200 OK"));

    uploader.write_all(b"F1F2").await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    caster.fanout.broadcast_tick().await;
    uploader.write_all(b"F3F4").await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    caster.fanout.broadcast_tick().await;

    let received = read_available(&mut subscriber, 256).await;
    let text = String::from_utf8_lossy(&received);
    assert!(text.contains("4\r\nF1F2\r\n"));
    assert!(text.contains("4\r\nF3F4\r\n"));

    shutdown.cancel();
}

/// Scenario 3: `GET /` serves a sourcetable body listing every online mount.
#[tokio::test]
async fn sourcetable_lists_online_mounts() {
    let catalog = Catalog::open(":memory:", "admin", "adminpw").unwrap();
    catalog.add_mount("MT01", "secret1", None).unwrap();
    catalog.add_mount("MT02", "secret2", None).unwrap();
    let (addr, _caster, shutdown) = spawn_caster(catalog).await;

    let mut up1 = TcpStream::connect(addr).await.unwrap();
    up1.write_all(b"SOURCE secret1 MT01\r\n").await.unwrap();
    let mut buf = [0u8; 32];
    up1.read(&mut buf).await.unwrap();

    let mut up2 = TcpStream::connect(addr).await.unwrap();
    up2.write_all(b"SOURCE secret2 MT02\r\n").await.unwrap();
    up2.read(&mut buf).await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
    let mut resp = Vec::new();
    let mut chunk = [0u8; 512];
    loop {
        match tokio::time::timeout(Duration::from_millis(200), client.read(&mut chunk)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => resp.extend_from_slice(&chunk[..n]),
            Ok(Err(_)) => break,
        }
    }
    let text = String::from_utf8_lossy(&resp);
    assert!(text.starts_with("SOURCETABLE 200 OK\r\n"));
    assert!(text.contains("STR;MT01;"));
    assert!(text.contains("STR;MT02;"));
    assert!(text.contains("ENDSOURCETABLE;"));

    shutdown.cancel();
}

/// Scenario 4: a station's STR fields are corrected once the metadata
/// parser recovers a fix from a 1005 message (exercised with a short test
/// window instead of the production 30s one).
#[tokio::test]
async fn str_correction_from_parsed_1005() {
    fn encode_1005(station_id: u16, x: i64, y: i64, z: i64) -> Vec<u8> {
        let mut bits: Vec<u8> = Vec::new();
        let mut push = |value: i64, n: u32| {
            for i in (0..n).rev() {
                bits.push(((value >> i) & 1) as u8);
            }
        };
        push(1005, 12);
        push(station_id as i64, 12);
        push(0, 6);
        push(0, 1);
        push(0, 1);
        push(0, 1);
        push(0, 1);
        push(x, 38);
        push(0, 1);
        push(0, 1);
        push(y, 38);
        push(0, 2);
        push(z, 38);
        let mut bytes = vec![0u8; bits.len().div_ceil(8)];
        for (i, bit) in bits.iter().enumerate() {
            if *bit == 1 {
                bytes[i / 8] |= 1 << (7 - (i % 8));
            }
        }
        bytes
    }

    fn rtcm_frame(payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(payload.len() + 6);
        frame.push(0xD3);
        frame.push(((payload.len() >> 8) & 0x03) as u8);
        frame.push((payload.len() & 0xff) as u8);
        frame.extend_from_slice(payload);
        // CRC is not validated by this test's direct ingest path (scan_frames
        // requires a valid CRC via rtcm-rs); the parser's own ingest() is
        // exercised with a raw payload instead.
        frame
    }
    let _ = rtcm_frame(&[]); // keep helper grounded in the real frame shape

    let x = (4_000_000.0_f64 / 0.0001) as i64;
    let y = (1_000_000.0_f64 / 0.0001) as i64;
    let z = (4_800_000.0_f64 / 0.0001) as i64;
    let payload = encode_1005(42, x, y, z);

    struct FixedGeocoder;
    impl ReverseGeocoder for FixedGeocoder {
        fn reverse_geocode(&self, _lat: f64, _lon: f64) -> Option<(String, String)> {
            Some(("CN".to_string(), "Beijing".to_string()))
        }
    }

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let (results_tx, mut results_rx) = tokio::sync::mpsc::unbounded_channel();
    tx.send(bytes::Bytes::from(payload)).unwrap();
    drop(tx);

    ntrip_caster::parser::run(
        "MT01".to_string(),
        rx,
        Duration::from_millis(20),
        Arc::new(FixedGeocoder),
        results_tx,
    )
    .await;

    let mut last = None;
    while let Some(r) = results_rx.recv().await {
        last = Some(r);
    }
    let result = last.expect("parser must emit at least a final result");
    assert!(result.fix_obtained);
    assert_eq!(result.station_id, Some(42));
    assert_eq!(result.identifier.as_deref(), Some("Beijing"));
    assert_eq!(result.country_iso3.as_deref(), Some("CHN"));
}

/// Scenario 5: admission cap evicts the oldest of three existing
/// subscribers when a fourth joins.
#[tokio::test]
async fn admission_cap_evicts_oldest_subscriber() {
    let catalog = Catalog::open(":memory:", "admin", "adminpw").unwrap();
    catalog.add_user("alice", "pw").unwrap();
    catalog.add_mount("MT01", "secret", None).unwrap();
    let (addr, caster, shutdown) = spawn_caster(catalog).await;

    let mut uploader = TcpStream::connect(addr).await.unwrap();
    uploader.write_all(b"SOURCE secret MT01\r\n").await.unwrap();
    let mut buf = [0u8; 32];
    uploader.read(&mut buf).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let creds = ntrip_caster::protocol::auth::encode_basic_auth("alice", "pw");
    let mut subs = Vec::new();
    for _ in 0..3 {
        let mut s = TcpStream::connect(addr).await.unwrap();
        s.write_all(format!("GET /MT01 HTTP/1.0\r\nAuthorization: {creds}\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut resp = [0u8; 32];
        s.read(&mut resp).await.unwrap();
        subs.push(s);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(caster.registry.user_connection_count("alice", "MT01"), 3);

    let mut fourth = TcpStream::connect(addr).await.unwrap();
    fourth
        .write_all(format!("GET /MT01 HTTP/1.0\r\nAuthorization: {creds}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut resp = [0u8; 32];
    fourth.read(&mut resp).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(caster.registry.user_connection_count("alice", "MT01"), 3);

    // The oldest subscriber's socket should now observe EOF.
    let oldest = &mut subs[0];
    let mut probe = [0u8; 8];
    let n = tokio::time::timeout(Duration::from_millis(200), oldest.read(&mut probe))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);

    shutdown.cancel();
}

/// Scenario 6: a slow consumer whose socket backs up past the send deadline
/// is evicted by the broadcast loop; a subscriber on the same mount that
/// keeps reading is untouched by that eviction (`FanoutEngine::deliver` is
/// called independently per subscriber within one `broadcast_tick` pass).
///
/// A large ring capacity keeps this scenario clear of the separate
/// buffer-overrun eviction path (covered directly in `fanout.rs`'s own
/// tests): every append here stays well under capacity, so the only way
/// either subscriber gets dropped is a send timeout.
#[tokio::test]
async fn slow_consumer_eviction_does_not_affect_others() {
    let catalog = Catalog::open(":memory:", "admin", "adminpw").unwrap();
    catalog.add_user("alice", "pw").unwrap();
    catalog.add_mount("MT01", "secret", None).unwrap();
    let (addr, caster, shutdown) = spawn_caster_with(catalog, |config| {
        config.ring_buffer_size = 4096;
        config.data_send_timeout_secs = 1;
    })
    .await;

    let mut uploader = TcpStream::connect(addr).await.unwrap();
    uploader.write_all(b"SOURCE secret MT01\r\n").await.unwrap();
    let mut buf = [0u8; 32];
    uploader.read(&mut buf).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let creds = ntrip_caster::protocol::auth::encode_basic_auth("alice", "pw");

    let mut slow = TcpStream::connect(addr).await.unwrap();
    slow.write_all(format!("GET /MT01 HTTP/1.0\r\nAuthorization: {creds}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut resp = [0u8; 32];
    slow.read(&mut resp).await.unwrap();

    let mut healthy = TcpStream::connect(addr).await.unwrap();
    healthy
        .write_all(format!("GET /MT01 HTTP/1.0\r\nAuthorization: {creds}\r\n\r\n").as_bytes())
        .await
        .unwrap();
    healthy.read(&mut resp).await.unwrap();

    // Keep healthy's socket drained throughout so its deliveries never back
    // up, while `slow` never reads at all.
    let drain = tokio::spawn(async move {
        let mut sink = [0u8; 8192];
        loop {
            match healthy.read(&mut sink).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    });

    // Push chunks large enough, and ticked often enough, that the never-read
    // "slow" socket's kernel send buffer fills and a write blocks past the
    // 1s send deadline. Bounded overall so a misbehaving change fails fast
    // instead of hanging.
    let chunk = vec![0xAAu8; 4096];
    let evicted = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            uploader.write_all(&chunk).await.unwrap();
            caster.fanout.broadcast_tick().await;
            if caster.registry.user_connection_count("alice", "MT01") < 2 {
                break;
            }
        }
    })
    .await;
    assert!(evicted.is_ok(), "slow subscriber was never evicted within the bound");

    // The slow subscriber's socket was closed server-side.
    let mut probe = [0u8; 8];
    let n = tokio::time::timeout(Duration::from_millis(200), slow.read(&mut probe))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);

    // The healthy subscriber and the mount itself are unaffected.
    assert!(caster.registry.is_mount_online("MT01"));
    assert_eq!(caster.registry.user_connection_count("alice", "MT01"), 1);

    drain.abort();
    shutdown.cancel();
}
