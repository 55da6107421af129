//! テスト用共通ヘルパーモジュール
//!
//! 統合テストで使用するモックS3サーバーを提供します。

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// テスト用モックS3サーバー
///
/// キーとオブジェクトの対応表を持ち、GETリクエストに対して
/// 登録済みオブジェクトを返します。未登録キーにはS3風の404 XMLを、
/// 障害モード時には500を返します。キーごとのGET回数を記録するため、
/// キャッシュヒットの検証に使えます。
pub struct MockS3Server {
    handle: Option<std::thread::JoinHandle<()>>,
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    fail: Arc<AtomicBool>,
    hits: Arc<Mutex<HashMap<String, usize>>>,
}

impl MockS3Server {
    /// 新しいモックS3サーバーを起動
    ///
    /// # Arguments
    /// * `objects` - (キー, ボディ, Content-Type) のタプル列
    pub fn start(objects: &[(&str, &str, &str)]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();
        let fail = Arc::new(AtomicBool::new(false));
        let fail_clone = fail.clone();
        let hits = Arc::new(Mutex::new(HashMap::new()));
        let hits_clone = hits.clone();

        let object_map: HashMap<String, (Vec<u8>, String)> = objects
            .iter()
            .map(|(key, body, content_type)| {
                (
                    key.to_string(),
                    (body.as_bytes().to_vec(), content_type.to_string()),
                )
            })
            .collect();

        let _ = listener.set_nonblocking(true);

        let handle = std::thread::spawn(move || {
            while !shutdown_clone.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        let _ = stream.set_read_timeout(Some(Duration::from_millis(100)));
                        let _ = stream.set_write_timeout(Some(Duration::from_secs(5)));

                        // リクエストを読み取る（リクエストラインのみ必要）
                        let mut buf = [0u8; 4096];
                        let n = match stream.read(&mut buf) {
                            Ok(n) => n,
                            Err(_) => continue,
                        };

                        let key = match request_key(&buf[..n]) {
                            Some(key) => key,
                            None => continue,
                        };

                        *hits_clone.lock().unwrap().entry(key.clone()).or_insert(0) += 1;

                        let response = if fail_clone.load(Ordering::Relaxed) {
                            error_response()
                        } else {
                            match object_map.get(&key) {
                                Some((body, content_type)) => ok_response(body, content_type),
                                None => not_found_response(&key),
                            }
                        };

                        let _ = stream.write_all(&response);
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    Err(_) => break,
                }
            }
        });

        Self {
            handle: Some(handle),
            addr,
            shutdown,
            fail,
            hits,
        }
    }

    /// サーバーのエンドポイントURLを取得
    pub fn endpoint_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.addr.port())
    }

    /// キーに対するGET回数を取得
    pub fn hits_for(&self, key: &str) -> usize {
        self.hits.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    /// 全リクエスト数を取得
    #[allow(dead_code)]
    pub fn total_hits(&self) -> usize {
        self.hits.lock().unwrap().values().sum()
    }

    /// 障害モードの切り替え（trueで全リクエストに500を返す）
    #[allow(dead_code)]
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::Relaxed);
    }
}

impl Drop for MockS3Server {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// リクエストラインからストレージキーを抽出
fn request_key(request: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(request).ok()?;
    let mut parts = text.lines().next()?.split_whitespace();
    let _method = parts.next()?;
    let path = parts.next()?;
    Some(path.trim_start_matches('/').to_string())
}

fn ok_response(body: &[u8], content_type: &str) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: {}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n",
        content_type,
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(body);
    response
}

fn not_found_response(key: &str) -> Vec<u8> {
    let body = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <Error><Code>NoSuchKey</Code><Key>{}</Key></Error>",
        key
    );
    format!(
        "HTTP/1.1 404 Not Found\r\n\
         Content-Type: application/xml\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        body.len(),
        body
    )
    .into_bytes()
}

fn error_response() -> Vec<u8> {
    b"HTTP/1.1 500 Internal Server Error\r\n\
      Content-Length: 0\r\n\
      Connection: close\r\n\
      \r\n"
        .to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_key() {
        assert_eq!(
            request_key(b"GET /docs/index.html HTTP/1.1\r\nHost: x\r\n\r\n"),
            Some("docs/index.html".to_string())
        );
        assert_eq!(request_key(b""), None);
    }

    #[test]
    fn test_mock_server_serves_object() {
        let server = MockS3Server::start(&[("index.html", "<html>top</html>", "text/html")]);

        let mut stream = std::net::TcpStream::connect(server.addr).unwrap();
        stream
            .write_all(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .unwrap();

        let mut response = String::new();
        let _ = stream.set_read_timeout(Some(Duration::from_secs(1)));
        let _ = stream.read_to_string(&mut response);

        assert!(response.contains("200 OK"));
        assert!(response.contains("<html>top</html>"));
        assert_eq!(server.hits_for("index.html"), 1);
    }

    #[test]
    fn test_mock_server_not_found() {
        let server = MockS3Server::start(&[]);

        let mut stream = std::net::TcpStream::connect(server.addr).unwrap();
        stream
            .write_all(b"GET /missing HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .unwrap();

        let mut response = String::new();
        let _ = stream.set_read_timeout(Some(Duration::from_secs(1)));
        let _ = stream.read_to_string(&mut response);

        assert!(response.contains("404 Not Found"));
        assert!(response.contains("NoSuchKey"));
    }
}
