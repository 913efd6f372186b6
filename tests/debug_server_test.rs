//! Debug routes over real pcap blockfiles

mod common;

use bytes::Bytes;
use capture_tracker::config::{DebugConfig, ThreadConfig};
use capture_tracker::debug_server::{parse_query_params, DebugServer};
use capture_tracker::health::HealthManager;
use capture_tracker::packet::Packet;
use capture_tracker::pcap_blockfile::{pcap_header, write_pcap, PcapBlockfileOpener};
use capture_tracker::shutdown::ShutdownCoordinator;
use capture_tracker::tracker::CaptureThread;
use common::{test_options, ScriptedDisk};
use http_body_util::BodyExt;
use hyper::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const RECORD_LEN: u32 = 16 + 60;

struct Harness {
    _root: TempDir,
    conf: ThreadConfig,
    thread: Arc<CaptureThread>,
    server: DebugServer,
}

impl Harness {
    fn new() -> Self {
        Self::with_disk(ScriptedDisk::always(80))
    }

    fn with_disk(disk: ScriptedDisk) -> Self {
        let root = TempDir::new().unwrap();
        let conf = ThreadConfig {
            packets_directory: root.path().join("disk/packets"),
            index_directory: root.path().join("disk/index"),
            disk_free_percentage: 10,
        };
        let thread = Arc::new(
            CaptureThread::new(
                0,
                conf.clone(),
                root.path(),
                test_options(),
                Arc::new(PcapBlockfileOpener),
                Arc::new(disk),
            )
            .unwrap(),
        );
        let mut server = DebugServer::new(Arc::new(DebugConfig::default()), vec![thread.clone()]);
        server.set_health_manager(Arc::new(HealthManager::new(
            vec![thread.clone()],
            Duration::from_secs(300),
        )));
        Self {
            _root: root,
            conf,
            thread,
            server,
        }
    }

    /// Write a pcap blockfile with one 60-byte packet per timestamp
    fn write_pcap_blockfile(&self, name: &str, timestamps: &[i64]) {
        let packets: Vec<Packet> = timestamps
            .iter()
            .map(|ts| Packet::new(*ts, 0, Bytes::from(vec![0x5a; 60])))
            .collect();
        let mut file = std::fs::File::create(self.conf.packets_directory.join(name)).unwrap();
        write_pcap(&mut file, &packets).unwrap();
        std::fs::write(self.conf.index_directory.join(name), b"").unwrap();
    }

    async fn get(&self, path: &str, query: &str, body: &str) -> (StatusCode, Bytes) {
        let params = parse_query_params(Some(query));
        let response = self
            .server
            .route(path, &params, Bytes::from(body.to_string()))
            .await;
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body)
    }
}

fn text(body: &Bytes) -> &str {
    std::str::from_utf8(body).unwrap()
}

#[tokio::test]
async fn test_files_lists_tracked_blockfiles() {
    let h = Harness::new();
    h.write_pcap_blockfile("0002", &[3]);
    h.write_pcap_blockfile("0001", &[1, 2]);
    h.thread.sync_files().await;

    let (status, body) = h.get("/debug/t0/files", "", "").await;

    assert_eq!(status, StatusCode::OK);
    let mut lines = text(&body).lines();
    let header = lines.next().unwrap();
    assert!(header.starts_with("Thread 0 (IDX: "));
    assert!(header.contains("IDX0"));
    assert!(header.contains("PKT0"));
    assert_eq!(lines.collect::<Vec<_>>(), vec!["\t0001", "\t0002"]);
}

#[tokio::test]
async fn test_positions_for_match_all_query() {
    let h = Harness::new();
    h.write_pcap_blockfile("0001", &[10, 20, 30]);
    h.thread.sync_files().await;

    let (status, body) = h.get("/debug/t0/positions", "name=0001", "all").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(text(&body), "POSITIONS:\n\tALL");
}

#[tokio::test]
async fn test_positions_are_hex_encoded_offsets() {
    let h = Harness::new();
    h.write_pcap_blockfile("0001", &[10, 20, 30]);
    h.thread.sync_files().await;

    let (status, body) = h.get("/debug/t0/positions", "name=0001", "after 20").await;

    assert_eq!(status, StatusCode::OK);
    let mut lines = text(&body).lines();
    assert_eq!(lines.next(), Some("POSITIONS:"));
    let offsets: Vec<u32> = lines
        .map(|line| {
            let raw = hex::decode(line.strip_prefix('\t').unwrap()).unwrap();
            u32::from_be_bytes(raw.try_into().unwrap())
        })
        .collect();
    assert_eq!(offsets, vec![24 + RECORD_LEN, 24 + 2 * RECORD_LEN]);
}

#[tokio::test]
async fn test_positions_rejects_bad_query() {
    let h = Harness::new();
    h.write_pcap_blockfile("0001", &[10]);
    h.thread.sync_files().await;

    let (status, body) = h.get("/debug/t0/positions", "name=0001", "sideways 3").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(text(&body), "could not parse query\n");
}

#[tokio::test]
async fn test_unknown_file_is_not_found() {
    let h = Harness::new();
    h.write_pcap_blockfile("0001", &[10]);
    h.thread.sync_files().await;

    for endpoint in ["index", "packets", "positions"] {
        let (status, body) = h
            .get(&format!("/debug/t0/{}", endpoint), "name=0009", "all")
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{}", endpoint);
        assert_eq!(text(&body), "file not found\n");
    }
}

#[tokio::test]
async fn test_unknown_thread_or_route_is_not_found() {
    let h = Harness::new();

    for path in ["/debug/t7/files", "/debug/t0/nope", "/debug/tx/files", "/other"] {
        let (status, _) = h.get(path, "", "").await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{}", path);
    }
}

#[tokio::test]
async fn test_index_rejects_bad_hex_bounds() {
    let h = Harness::new();
    h.write_pcap_blockfile("0001", &[1, 2, 3]);
    h.thread.sync_files().await;

    let (status, body) = h.get("/debug/t0/index", "name=0001&start=xyz", "").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(text(&body), "bad start\n");

    let (status, body) = h.get("/debug/t0/index", "name=0001&finish=0", "").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(text(&body), "bad finish\n");
}

#[tokio::test]
async fn test_index_dump_within_bounds() {
    let h = Harness::new();
    h.write_pcap_blockfile("0001", &[1, 2, 3]);
    h.thread.sync_files().await;

    let (status, body) = h
        .get(
            "/debug/t0/index",
            "name=0001&start=0000000000000002&finish=0000000000000003",
            "",
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        text(&body),
        format!(
            "0000000000000002\t{}\n0000000000000003\t{}\n",
            24 + RECORD_LEN,
            24 + 2 * RECORD_LEN
        )
    );
}

#[tokio::test]
async fn test_packets_streams_pcap_file() {
    let h = Harness::new();
    h.write_pcap_blockfile("0001", &[1_000_001, 2_000_002]);
    h.thread.sync_files().await;

    let (status, body) = h.get("/debug/t0/packets", "name=0001", "").await;

    assert_eq!(status, StatusCode::OK);
    let on_disk = std::fs::read(h.conf.packets_directory.join("0001")).unwrap();
    assert_eq!(body.as_ref(), on_disk.as_slice());
    assert_eq!(&body[..24], pcap_header().as_ref());
}

#[tokio::test]
async fn test_unfinished_packets_body_blocks_eviction() {
    let h = Harness::with_disk(ScriptedDisk::new(vec![Ok(80)], Ok(5)));
    h.write_pcap_blockfile("0001", &[1, 2]);
    h.thread.sync_files().await;

    let params = parse_query_params(Some("name=0001"));
    let response = h.server.route("/debug/t0/packets", &params, Bytes::new()).await;
    assert_eq!(response.status(), StatusCode::OK);

    let thread = h.thread.clone();
    let sync = tokio::spawn(async move { thread.sync_files().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!sync.is_finished(), "evicted a file that was still being served");

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.len(), 24 + 2 * RECORD_LEN as usize);

    let report = tokio::time::timeout(Duration::from_secs(2), sync)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.evicted, vec!["0001"]);
}

#[tokio::test]
async fn test_healthz_reports_threads() {
    let h = Harness::new();
    h.write_pcap_blockfile("0001", &[1]);
    h.thread.sync_files().await;

    let (status, body) = h.get("/healthz", "", "").await;

    assert_eq!(status, StatusCode::OK);
    let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], "Healthy");
    assert_eq!(health["threads"][0]["tracked_files"], 1);
}

#[tokio::test]
async fn test_serves_over_tcp_until_shutdown() {
    let h = Harness::new();
    h.write_pcap_blockfile("0001", &[1]);
    h.thread.sync_files().await;

    let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = h.server.clone();
    let signal = coordinator.signal();
    let handle = tokio::spawn(async move {
        server.serve(listener, signal).await.unwrap();
    });
    coordinator.register_task("debug server", handle).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /debug/t0/files HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200 OK"));
    assert!(response.ends_with("\t0001\n"));

    coordinator.initiate_shutdown().await.unwrap();
}
