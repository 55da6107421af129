//! # Kagami - S3リバースプロキシキャッシュサーバー
//!
//! S3互換オブジェクトストレージを上流とする静的サイト配信プロキシです。
//! io_uring（monoio）ベースのthread-per-coreアーキテクチャで動作し、
//! 取得したオブジェクトをローカルディスクへキャッシュして配信します。
//!
//! ## アーキテクチャ
//!
//! ```text
//! クライアント --HTTP--> [ワーカースレッド xN (SO_REUSEPORT)]
//!                              |
//!                         [リゾルバ] -- フォールバックチェーン
//!                              |
//!                       [ディスクキャッシュ] -- mtime + 固定TTL
//!                              |
//!                        [S3クライアント] --HTTPS--> S3/MinIO
//! ```
//!
//! ## エンドポイント
//!
//! - `GET /health` - ヘルスチェック
//! - `GET|POST /admin/cache/clear` - キャッシュ全消去
//! - `GET /admin/cache/status` - キャッシュ状態（JSON）
//! - `GET /<path>` - コンテンツ解決（`?refresh=1` で強制再取得）

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use ftlog::{error, info};
use httparse::{Request, Status};
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::{TcpListener, TcpStream};
use monoio::time::timeout;
use monoio::RuntimeBuilder;
use rustls::crypto::CryptoProvider;
use serde_json::json;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use time::OffsetDateTime;

use kagami::cache::CacheStore;
use kagami::config::{load_config, Config};
use kagami::resolve::{Resolution, Resolver, Strategy};
use kagami::store::{S3Client, StoreError};

// ====================
// 静的レスポンス
// ====================

static ERR_MSG_BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
static ERR_MSG_METHOD_NOT_ALLOWED: &[u8] = b"HTTP/1.1 405 Method Not Allowed\r\nAllow: GET, POST\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
static ERR_MSG_REQUEST_TOO_LARGE: &[u8] = b"HTTP/1.1 413 Request Entity Too Large\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

// レスポンス構築用フラグメント
static STATUS_200: &[u8] = b"HTTP/1.1 200 OK";
static STATUS_404: &[u8] = b"HTTP/1.1 404 Not Found";
static STATUS_500: &[u8] = b"HTTP/1.1 500 Internal Server Error";
static CONTENT_TYPE_HEADER: &[u8] = b"\r\nContent-Type: ";
static CONTENT_LENGTH_HEADER: &[u8] = b"\r\nContent-Length: ";
static CONNECTION_KEEP_ALIVE: &[u8] = b"\r\nConnection: keep-alive\r\n\r\n";
static CONNECTION_CLOSE: &[u8] = b"\r\nConnection: close\r\n\r\n";

// バッファサイズ
const BUF_SIZE: usize = 65536;          // 64KB - io_uring最適サイズ
const MAX_HEADER_SIZE: usize = 8192;    // 8KB - ヘッダーサイズ上限

// タイムアウト
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

// ====================
// Graceful Shutdown
// ====================

static SHUTDOWN_FLAG: AtomicBool = AtomicBool::new(false);

// ====================
// バッファプール（スレッドローカル）
// ====================

const BUF_POOL_MAX: usize = 64;

thread_local! {
    static BUF_POOL: RefCell<VecDeque<Vec<u8>>> = RefCell::new(VecDeque::with_capacity(BUF_POOL_MAX));
}

fn buf_get() -> Vec<u8> {
    BUF_POOL.with(|pool| {
        pool.borrow_mut()
            .pop_front()
            .unwrap_or_else(|| vec![0u8; BUF_SIZE])
    })
}

fn buf_put(mut buf: Vec<u8>) {
    BUF_POOL.with(|pool| {
        let mut pool = pool.borrow_mut();
        if pool.len() < BUF_POOL_MAX && buf.capacity() >= BUF_SIZE {
            buf.clear();
            buf.resize(BUF_SIZE, 0);
            pool.push_back(buf);
        }
    });
}

// ====================
// プロキシコンテキスト
// ====================

/// ワーカースレッドごとの共有状態
///
/// リゾルバ（キャッシュ + S3クライアント）と管理エンドポイントが
/// 返すバケット情報を保持します。スレッド内でのみ共有されるため
/// `Rc` で十分です。
struct ProxyContext {
    resolver: Resolver<S3Client>,
    bucket: String,
    region: String,
}

impl ProxyContext {
    fn new(config: &Config) -> io::Result<Self> {
        let client = S3Client::new(&config.store.endpoint_url())?;
        let cache = CacheStore::new(&config.cache, client);
        Ok(Self {
            resolver: Resolver::new(cache),
            bucket: config.store.bucket.clone(),
            region: config.store.region.clone(),
        })
    }
}

// ====================
// エントリーポイント
// ====================

fn main() {
    // プロセスレベルで暗号プロバイダーをインストール（ring使用、上流TLS用）
    CryptoProvider::install_default(rustls::crypto::ring::default_provider())
        .expect("Failed to install rustls crypto provider");

    let _guard = ftlog::Builder::new().try_init().unwrap();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let config = match load_config(Path::new(&config_path)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config load error ({}): {}", config_path, e);
            return;
        }
    };

    let listen_addr = config
        .server
        .listen
        .parse::<SocketAddr>()
        .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 8080)));

    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());

    info!("============================================");
    info!("Kagami S3 Reverse Proxy Cache Server");
    info!("Hostname: {}", hostname);
    info!("Listen Address: {}", listen_addr);
    info!("Threads: {}", num_cpus::get());
    info!("Bucket: {} ({})", config.store.bucket, config.store.region);
    info!("Endpoint: {}", config.store.endpoint_url());
    info!("Cache Dir: {}", config.cache.dir.display());
    info!("Cache TTL: {}s", config.cache.ttl_secs);
    info!("============================================");

    // Graceful Shutdown用のシグナルハンドラを設定
    setup_signal_handler();

    let num_threads = num_cpus::get();
    let mut handles = Vec::with_capacity(num_threads);

    for thread_id in 0..num_threads {
        let config_clone = config.clone();
        let addr = listen_addr;

        let handle = thread::spawn(move || {
            let mut rt = RuntimeBuilder::<monoio::FusionDriver>::new()
                .enable_timer()
                .build()
                .expect("Failed to create runtime");
            rt.block_on(async move {
                let listener = match create_listener(addr) {
                    Ok(l) => l,
                    Err(e) => {
                        error!("[Thread {}] Bind error: {}", thread_id, e);
                        return;
                    }
                };

                let ctx = match ProxyContext::new(&config_clone) {
                    Ok(c) => Rc::new(c),
                    Err(e) => {
                        error!("[Thread {}] Context init error: {}", thread_id, e);
                        return;
                    }
                };

                info!("[Thread {}] Worker started", thread_id);

                loop {
                    // Shutdown チェック
                    if SHUTDOWN_FLAG.load(Ordering::Relaxed) {
                        info!("[Thread {}] Shutting down...", thread_id);
                        break;
                    }

                    // タイムアウト付きaccept（Graceful Shutdown対応）
                    let accept_result = timeout(Duration::from_secs(1), listener.accept()).await;

                    let (stream, _peer_addr) = match accept_result {
                        Ok(Ok(s)) => s,
                        Ok(Err(e)) => {
                            error!("[Thread {}] Accept error: {}", thread_id, e);
                            continue;
                        }
                        Err(_) => {
                            // タイムアウト - ループを継続してshutdownチェック
                            continue;
                        }
                    };

                    let _ = stream.set_nodelay(true);

                    let ctx = ctx.clone();
                    monoio::spawn(async move {
                        handle_requests(stream, ctx).await;
                    });
                }

                info!("[Thread {}] Worker stopped", thread_id);
            });
        });
        handles.push(handle);
    }

    for handle in handles {
        let _ = handle.join();
    }

    info!("Server shutdown complete");
}

/// シグナルハンドラのセットアップ
fn setup_signal_handler() {
    // SIGINT, SIGTERM をキャッチしてシャットダウンフラグを設定
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, initiating graceful shutdown...");
        SHUTDOWN_FLAG.store(true, Ordering::SeqCst);
    })
    .expect("Failed to set signal handler");
}

fn create_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let config = monoio::net::ListenerConfig::default()
        .reuse_port(true)
        .backlog(8192);
    TcpListener::bind_with_config(addr, &config)
}

// ====================
// リクエスト処理ループ
// ====================

async fn handle_requests(mut stream: TcpStream, ctx: Rc<ProxyContext>) {
    let mut accumulated = Vec::with_capacity(BUF_SIZE);

    loop {
        // 読み込み（アイドルタイムアウト付き）
        let read_buf = buf_get();
        let read_result = timeout(IDLE_TIMEOUT, stream.read(read_buf)).await;

        let (res, returned_buf) = match read_result {
            Ok(result) => result,
            Err(_) => {
                // アイドルタイムアウト - 接続を閉じる
                return;
            }
        };

        let n = match res {
            Ok(0) => {
                buf_put(returned_buf);
                return;
            }
            Ok(n) => n,
            Err(_) => {
                buf_put(returned_buf);
                return;
            }
        };

        // 読み込んだデータを蓄積
        accumulated.extend_from_slice(&returned_buf[..n]);
        buf_put(returned_buf);

        // ヘッダーサイズ制限チェック
        if accumulated.len() > MAX_HEADER_SIZE {
            let err_buf = ERR_MSG_REQUEST_TOO_LARGE.to_vec();
            let _ = timeout(WRITE_TIMEOUT, stream.write_all(err_buf)).await;
            return;
        }

        // HTTPリクエストをパース
        let mut headers_storage = [httparse::EMPTY_HEADER; 64];
        let mut req = Request::new(&mut headers_storage);

        match req.parse(&accumulated) {
            Ok(Status::Complete(_header_len)) => {
                let method = req.method.unwrap_or("GET").to_string();
                let raw_path = req.path.unwrap_or("/").to_string();

                let user_agent: Box<[u8]> = req
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("user-agent"))
                    .map(|h| Box::from(h.value))
                    .unwrap_or_else(|| Box::from([] as [u8; 0]));

                let content_length: usize = req
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("content-length"))
                    .and_then(|h| std::str::from_utf8(h.value).ok())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);

                let has_body = content_length > 0
                    || req
                        .headers
                        .iter()
                        .any(|h| h.name.eq_ignore_ascii_case("transfer-encoding"));

                // Connection: close チェック（Keep-Alive対応）
                let client_wants_close: bool = req
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("connection"))
                    .map(|h| h.value.eq_ignore_ascii_case(b"close"))
                    .unwrap_or(false);

                drop(req);

                // リクエストボディは読み捨てないため、ボディ付きリクエストは
                // 応答後に接続を閉じてパイプラインのずれを防ぐ
                let keep_alive = !client_wants_close && !has_body;
                accumulated.clear();

                let start_time = OffsetDateTime::now_utc();

                let (status, response) = route_request(&ctx, &method, &raw_path, keep_alive).await;
                let resp_size = response.len() as u64;

                let (write_res, _) = match timeout(WRITE_TIMEOUT, stream.write_all(response)).await
                {
                    Ok(result) => result,
                    Err(_) => return,
                };

                log_access(
                    raw_path.as_bytes(),
                    &user_agent,
                    content_length as u64,
                    status,
                    resp_size,
                    start_time,
                );

                if write_res.is_err() || !keep_alive {
                    return;
                }
                // Keep-Alive: ループを継続して次のリクエストを待機
            }
            Ok(Status::Partial) => {
                // データ不足、次の読み込みを待つ
                continue;
            }
            Err(_) => {
                let err_buf = ERR_MSG_BAD_REQUEST.to_vec();
                let _ = timeout(WRITE_TIMEOUT, stream.write_all(err_buf)).await;
                return;
            }
        }
    }
}

// ====================
// ルーティング
// ====================

/// リクエストをルーティングし、シリアライズ済みレスポンスを返す
async fn route_request(
    ctx: &ProxyContext,
    method: &str,
    raw_path: &str,
    keep_alive: bool,
) -> (u16, Vec<u8>) {
    let (path, query) = split_query(raw_path);

    match (method, path) {
        ("GET", "/health") => (
            200,
            build_response(STATUS_200, "text/plain", &[], b"OK", keep_alive),
        ),
        ("GET", "/admin/cache/clear") | ("POST", "/admin/cache/clear") => {
            handle_cache_clear(ctx, keep_alive)
        }
        ("GET", "/admin/cache/status") => handle_cache_status(ctx, keep_alive),
        ("GET", _) => {
            let force_refresh = has_refresh_param(query);
            handle_resolve(ctx, path, force_refresh, keep_alive).await
        }
        _ => (405, ERR_MSG_METHOD_NOT_ALLOWED.to_vec()),
    }
}

/// キャッシュ全消去エンドポイント
fn handle_cache_clear(ctx: &ProxyContext, keep_alive: bool) -> (u16, Vec<u8>) {
    match ctx.resolver.cache().clear() {
        Ok(cleared_count) => {
            info!("Cache cleared: {} files removed", cleared_count);
            let body = json!({
                "status": "success",
                "message": format!("{} 件のキャッシュファイルを削除しました", cleared_count),
                "cleared_count": cleared_count,
            });
            json_response(STATUS_200, 200, &body, keep_alive)
        }
        Err(e) => {
            error!("Cache clear failed: {}", e);
            let body = json!({
                "status": "error",
                "message": e.to_string(),
            });
            json_response(STATUS_500, 500, &body, keep_alive)
        }
    }
}

/// キャッシュ状態エンドポイント
fn handle_cache_status(ctx: &ProxyContext, keep_alive: bool) -> (u16, Vec<u8>) {
    let cache = ctx.resolver.cache();
    match cache.entries() {
        Ok(files) => {
            let body = json!({
                "cache_dir": cache.dir().display().to_string(),
                "cache_ttl": cache.ttl_secs(),
                "total_files": files.len(),
                "files": files,
                "bucket": ctx.bucket,
                "region": ctx.region,
            });
            json_response(STATUS_200, 200, &body, keep_alive)
        }
        Err(e) => {
            error!("Cache status scan failed: {}", e);
            let body = json!({
                "status": "error",
                "message": e.to_string(),
            });
            json_response(STATUS_500, 500, &body, keep_alive)
        }
    }
}

/// コンテンツ解決エンドポイント
///
/// 解決に使われた戦略をレスポンスヘッダーで通知します。
async fn handle_resolve(
    ctx: &ProxyContext,
    path: &str,
    force_refresh: bool,
    keep_alive: bool,
) -> (u16, Vec<u8>) {
    match ctx.resolver.resolve(path, force_refresh).await {
        Ok(Resolution::Found {
            strategy,
            key,
            body,
            content_type,
        }) => {
            let mut headers: Vec<(&str, String)> = Vec::with_capacity(5);
            match strategy {
                Strategy::DirectHit => {
                    headers.push(("X-S3-Key", key.clone()));
                    headers.push(("X-Direct-Hit", "true".to_string()));
                }
                Strategy::DirectoryIndex => {
                    headers.push(("X-S3-Key", key.clone()));
                    headers.push(("X-Directory-Index", "true".to_string()));
                }
                Strategy::SubdirectoryRedirect => {
                    headers.push(("X-Redirected-From", path.to_string()));
                    headers.push(("X-Redirected-To", format!("/{}", key)));
                    headers.push(("X-Subdirectory-Redirect", "true".to_string()));
                    headers.push(("X-S3-Key", key.clone()));
                }
                Strategy::RootFallback => {
                    headers.push(("X-Redirected-From", path.to_string()));
                    headers.push(("X-Redirected-To", format!("/{}", key)));
                    headers.push(("X-Root-Fallback", "true".to_string()));
                    headers.push(("X-S3-Key", key.clone()));
                }
            }
            if force_refresh {
                headers.push(("X-Cache-Status", "REFRESHED".to_string()));
            }

            (
                200,
                build_response(STATUS_200, &content_type, &headers, &body, keep_alive),
            )
        }
        Ok(Resolution::NotFound) => (
            404,
            build_response(STATUS_404, "text/plain", &[], b"", keep_alive),
        ),
        Err(StoreError::NotFound) => (
            404,
            build_response(STATUS_404, "text/plain", &[], b"", keep_alive),
        ),
        Err(StoreError::Failure(e)) => {
            error!("Upstream store failure for {}: {}", path, e);
            (
                500,
                build_response(STATUS_500, "text/plain", &[], b"", keep_alive),
            )
        }
    }
}

// ====================
// レスポンス構築
// ====================

/// ステータスライン・Content-Type・追加ヘッダー・ボディから
/// HTTP/1.1レスポンスをシリアライズ
fn build_response(
    status_line: &[u8],
    content_type: &str,
    extra_headers: &[(&str, String)],
    body: &[u8],
    keep_alive: bool,
) -> Vec<u8> {
    let mut buf = itoa::Buffer::new();
    let len_str = buf.format(body.len());

    let mut response = Vec::with_capacity(256 + body.len());
    response.extend_from_slice(status_line);
    response.extend_from_slice(CONTENT_TYPE_HEADER);
    response.extend_from_slice(content_type.as_bytes());
    response.extend_from_slice(CONTENT_LENGTH_HEADER);
    response.extend_from_slice(len_str.as_bytes());
    for (name, value) in extra_headers {
        response.extend_from_slice(b"\r\n");
        response.extend_from_slice(name.as_bytes());
        response.extend_from_slice(b": ");
        response.extend_from_slice(value.as_bytes());
    }
    if keep_alive {
        response.extend_from_slice(CONNECTION_KEEP_ALIVE);
    } else {
        response.extend_from_slice(CONNECTION_CLOSE);
    }
    response.extend_from_slice(body);
    response
}

/// JSONボディ付きレスポンス
fn json_response(
    status_line: &[u8],
    status: u16,
    body: &serde_json::Value,
    keep_alive: bool,
) -> (u16, Vec<u8>) {
    let serialized = serde_json::to_vec(body).unwrap_or_default();
    (
        status,
        build_response(
            status_line,
            "application/json",
            &[],
            &serialized,
            keep_alive,
        ),
    )
}

// ====================
// クエリ文字列
// ====================

/// パスをパス部とクエリ部に分割
fn split_query(raw_path: &str) -> (&str, &str) {
    match raw_path.split_once('?') {
        Some((path, query)) => (path, query),
        None => (raw_path, ""),
    }
}

/// `refresh=1` パラメータの有無
fn has_refresh_param(query: &str) -> bool {
    query.split('&').any(|param| param == "refresh=1")
}

// ====================
// ロギング
// ====================

fn log_access(
    path: &[u8],
    ua: &[u8],
    req_body_size: u64,
    status: u16,
    resp_body_size: u64,
    start_time: OffsetDateTime,
) {
    let end_time = OffsetDateTime::now_utc();
    let duration_ms = (end_time - start_time).whole_milliseconds();
    let path_str = std::str::from_utf8(path).unwrap_or("-");
    let ua_str = std::str::from_utf8(ua).unwrap_or("-");

    info!(
        "Access: time={} duration={}ms path={} ua={} req_body_size={} status={} resp_body_size={}",
        start_time, duration_ms, path_str, ua_str, req_body_size, status, resp_body_size
    );
}
