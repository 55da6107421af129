//! S3互換オブジェクトストレージクライアント
//!
//! HTTP(S)/1.1でS3互換エンドポイントへGETリクエストを送信します。
//! スレッドローカルなコネクションプールにより接続を再利用し、
//! HTTPSの場合はrustls + webpki-rootsでTLS接続を確立します。
//!
//! 認証は行いません（公開ウェブサイトバケット向けの匿名GET）。

use super::http::{
    read_response, send_request, AsyncReader, AsyncWriter, ClientTls, CONNECT_TIMEOUT,
};
use super::{ObjectStore, StoreError, StoreObject};
use ftlog::error;
use monoio::net::TcpStream;
use monoio::time::timeout;
use monoio_rustls::TlsConnector;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;

// コネクションプール設定
const POOL_MAX_IDLE_PER_HOST: usize = 8;
const POOL_IDLE_TIMEOUT_SECS: u64 = 30;

// ====================
// TLSコネクタ（スレッドローカル）
// ====================

thread_local! {
    static TLS_CONNECTOR: TlsConnector = {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let client_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        TlsConnector::from(Arc::new(client_config))
    };
}

// ====================
// アップストリームコネクションプール
// ====================

/// プールされた接続のエントリ
struct PooledConnection<T> {
    stream: T,
    created_at: std::time::Instant,
}

impl<T> PooledConnection<T> {
    fn new(stream: T) -> Self {
        Self {
            stream,
            created_at: std::time::Instant::now(),
        }
    }

    /// 接続がまだ有効かどうかを判定（アイドルタイムアウトチェック）
    fn is_valid(&self) -> bool {
        self.created_at.elapsed().as_secs() < POOL_IDLE_TIMEOUT_SECS
    }
}

/// ホスト:ポートをキーにしたコネクションプール
struct ConnectionPool<T> {
    connections: HashMap<String, VecDeque<PooledConnection<T>>>,
}

impl<T> ConnectionPool<T> {
    fn new() -> Self {
        Self {
            connections: HashMap::new(),
        }
    }

    /// プールから接続を取得（有効な接続がなければNone）
    fn get(&mut self, key: &str) -> Option<T> {
        if let Some(queue) = self.connections.get_mut(key) {
            while let Some(entry) = queue.pop_front() {
                if entry.is_valid() {
                    return Some(entry.stream);
                }
                // 無効な接続は破棄
            }
        }
        None
    }

    /// 接続をプールに返却
    fn put(&mut self, key: String, stream: T) {
        let queue = self.connections.entry(key).or_insert_with(VecDeque::new);
        while queue.len() >= POOL_MAX_IDLE_PER_HOST {
            queue.pop_front();
        }
        queue.push_back(PooledConnection::new(stream));
    }
}

thread_local! {
    static TCP_POOL: RefCell<ConnectionPool<TcpStream>> = RefCell::new(ConnectionPool::new());
    static TLS_POOL: RefCell<ConnectionPool<ClientTls>> = RefCell::new(ConnectionPool::new());
}

// ====================
// エンドポイント
// ====================

/// ストレージエンドポイント
///
/// デフォルトは仮想ホスト形式のAWS URL
/// （`https://{bucket}.s3.{region}.amazonaws.com`）。MinIO等の
/// パス形式エンドポイントは `path_prefix` にバケット名を含めて表現します。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub path_prefix: String,
}

impl Endpoint {
    /// URL文字列からエンドポイントを解析
    pub fn parse(url: &str) -> Option<Self> {
        let (use_tls, rest) = if let Some(rest) = url.strip_prefix("https://") {
            (true, rest)
        } else if let Some(rest) = url.strip_prefix("http://") {
            (false, rest)
        } else {
            return None;
        };

        let (host_port, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };

        let (host, port) = match host_port.find(':') {
            Some(idx) => {
                let h = &host_port[..idx];
                let p = host_port[idx + 1..].parse().ok()?;
                (h.to_string(), p)
            }
            None => (host_port.to_string(), if use_tls { 443 } else { 80 }),
        };

        if host.is_empty() {
            return None;
        }

        Some(Endpoint {
            host,
            port,
            use_tls,
            path_prefix: path.to_string(),
        })
    }

    /// デフォルトポートかどうかを判定
    #[inline]
    fn is_default_port(&self) -> bool {
        if self.use_tls {
            self.port == 443
        } else {
            self.port == 80
        }
    }

    /// プールキー（host:port）
    fn pool_key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// キーに対応するリクエストパスを構築
    fn object_path(&self, key: &str) -> String {
        let base = self.path_prefix.trim_end_matches('/');
        format!("{}/{}", base, key)
    }
}

// ====================
// S3クライアント
// ====================

/// S3互換エンドポイントへの匿名GETクライアント
#[derive(Clone, Debug)]
pub struct S3Client {
    endpoint: Endpoint,
}

impl S3Client {
    /// エンドポイントURLからクライアントを作成
    pub fn new(endpoint_url: &str) -> io::Result<Self> {
        let endpoint = Endpoint::parse(endpoint_url).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid store endpoint: {}", endpoint_url),
            )
        })?;
        Ok(Self { endpoint })
    }

    /// 仮想ホスト形式のAWSエンドポイントでクライアントを作成
    pub fn for_bucket(bucket: &str, region: &str) -> io::Result<Self> {
        Self::new(&format!("https://{}.s3.{}.amazonaws.com", bucket, region))
    }

    #[inline]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// GETリクエストのバイト列を構築
    fn build_request(&self, key: &str) -> Vec<u8> {
        let path = self.endpoint.object_path(key);

        let mut request = Vec::with_capacity(256);
        request.extend_from_slice(b"GET ");
        request.extend_from_slice(path.as_bytes());
        request.extend_from_slice(b" HTTP/1.1\r\nHost: ");
        request.extend_from_slice(self.endpoint.host.as_bytes());
        if !self.endpoint.is_default_port() {
            request.extend_from_slice(b":");
            let mut port_buf = itoa::Buffer::new();
            request.extend_from_slice(port_buf.format(self.endpoint.port).as_bytes());
        }
        request.extend_from_slice(b"\r\nAccept: */*\r\nConnection: keep-alive\r\n\r\n");
        request
    }

    /// レスポンスステータスをストア結果へマップ
    fn map_response(
        &self,
        key: &str,
        status: u16,
        content_type: Option<String>,
        body: Vec<u8>,
    ) -> Result<StoreObject, StoreError> {
        match status {
            200 => Ok(StoreObject {
                body,
                content_type: content_type
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
            }),
            404 => Err(StoreError::NotFound),
            _ => {
                error!(
                    "store returned unexpected status {} for key {}",
                    status, key
                );
                Err(StoreError::Failure(io::Error::new(
                    io::ErrorKind::Other,
                    format!("unexpected store status {}", status),
                )))
            }
        }
    }

    async fn dial(&self) -> io::Result<TcpStream> {
        let addr = self.endpoint.pool_key();
        let connect_result = timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await;
        match connect_result {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                Ok(stream)
            }
            Ok(Err(e)) => {
                error!("store connect error to {}: {}", addr, e);
                Err(e)
            }
            Err(_) => {
                error!("store connect timeout to {}", addr);
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "store connect timeout",
                ))
            }
        }
    }

    /// 接続上でリクエスト・レスポンスを1往復
    async fn roundtrip<S: AsyncReader + AsyncWriter>(
        &self,
        stream: &mut S,
        key: &str,
    ) -> io::Result<(u16, Option<String>, Vec<u8>, bool)> {
        send_request(stream, self.build_request(key)).await?;
        let response = read_response(stream).await?;
        Ok((
            response.status,
            response.content_type,
            response.body,
            response.keep_alive,
        ))
    }

    async fn fetch_plain(&self, key: &str) -> Result<StoreObject, StoreError> {
        let pool_key = self.endpoint.pool_key();
        let mut stream = match TCP_POOL.with(|p| p.borrow_mut().get(&pool_key)) {
            Some(stream) => stream,
            None => self.dial().await?,
        };

        let (status, content_type, body, keep_alive) = self.roundtrip(&mut stream, key).await?;
        if keep_alive {
            TCP_POOL.with(|p| p.borrow_mut().put(pool_key, stream));
        }
        self.map_response(key, status, content_type, body)
    }

    async fn fetch_tls(&self, key: &str) -> Result<StoreObject, StoreError> {
        let pool_key = self.endpoint.pool_key();
        let mut stream = match TLS_POOL.with(|p| p.borrow_mut().get(&pool_key)) {
            Some(stream) => stream,
            None => {
                let tcp = self.dial().await?;

                let server_name =
                    ServerName::try_from(self.endpoint.host.clone()).map_err(|e| {
                        io::Error::new(
                            io::ErrorKind::InvalidInput,
                            format!("invalid server name {}: {}", self.endpoint.host, e),
                        )
                    })?;

                let connector = TLS_CONNECTOR.with(|c| c.clone());
                let tls_result = timeout(CONNECT_TIMEOUT, connector.connect(server_name, tcp)).await;
                match tls_result {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        error!("store TLS connect error to {}: {}", self.endpoint.host, e);
                        return Err(StoreError::Failure(io::Error::new(
                            io::ErrorKind::Other,
                            e.to_string(),
                        )));
                    }
                    Err(_) => {
                        error!("store TLS connect timeout to {}", self.endpoint.host);
                        return Err(StoreError::Failure(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "store TLS connect timeout",
                        )));
                    }
                }
            }
        };

        let (status, content_type, body, keep_alive) = self.roundtrip(&mut stream, key).await?;
        if keep_alive {
            TLS_POOL.with(|p| p.borrow_mut().put(pool_key, stream));
        }
        self.map_response(key, status, content_type, body)
    }
}

impl ObjectStore for S3Client {
    async fn get_object(&self, key: &str) -> Result<StoreObject, StoreError> {
        if self.endpoint.use_tls {
            self.fetch_tls(key).await
        } else {
            self.fetch_plain(key).await
        }
    }
}
