//! アップストリームHTTP/1.1プラミング
//!
//! オブジェクトストレージへのHTTP/1.1リクエストに必要な、
//! レスポンスヘッダー解析とボディ受信（Content-Length / chunked / EOF）を
//! 提供します。TCPとTLSのストリームを共通に扱うための
//! 非同期I/Oトレイトもここで定義します。

use httparse::Status;
use monoio::io::{AsyncReadRent, AsyncWriteRentExt};
use monoio::net::TcpStream;
use monoio::time::timeout;
use monoio_rustls::ClientTlsStream;
use std::io;
use std::time::Duration;

// タイムアウト設定
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const READ_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

// バッファ・サイズ制限
const BUF_SIZE: usize = 65536;
const MAX_HEADER_SIZE: usize = 16384;

/// TLSクライアントストリーム型エイリアス
pub(crate) type ClientTls = ClientTlsStream<TcpStream>;

// ====================
// 非同期I/Oトレイト（TCP/TLS共通化）
// ====================

/// 非同期読み込みトレイト
pub(crate) trait AsyncReader {
    async fn read_buf(&mut self, buf: Vec<u8>) -> (io::Result<usize>, Vec<u8>);
}

/// 非同期書き込みトレイト
pub(crate) trait AsyncWriter {
    async fn write_buf(&mut self, buf: Vec<u8>) -> (io::Result<usize>, Vec<u8>);
}

impl AsyncReader for TcpStream {
    async fn read_buf(&mut self, buf: Vec<u8>) -> (io::Result<usize>, Vec<u8>) {
        self.read(buf).await
    }
}

impl AsyncWriter for TcpStream {
    async fn write_buf(&mut self, buf: Vec<u8>) -> (io::Result<usize>, Vec<u8>) {
        self.write_all(buf).await
    }
}

impl AsyncReader for ClientTls {
    async fn read_buf(&mut self, buf: Vec<u8>) -> (io::Result<usize>, Vec<u8>) {
        self.read(buf).await
    }
}

impl AsyncWriter for ClientTls {
    async fn write_buf(&mut self, buf: Vec<u8>) -> (io::Result<usize>, Vec<u8>) {
        self.write_all(buf).await
    }
}

// ====================
// レスポンスヘッダー解析（httparse使用）
// ====================

/// httparseによるレスポンスヘッダー解析結果
struct ParsedHead {
    status_code: u16,
    /// ヘッダー終端位置（ボディ開始位置）
    header_len: usize,
    content_length: Option<usize>,
    is_chunked: bool,
    /// Connection: close かどうか（HTTP/1.1のデフォルトはkeep-alive）
    is_connection_close: bool,
    content_type: Option<String>,
}

/// Transfer-Encoding ヘッダー値から chunked かどうかを判定
fn is_chunked_encoding(value: &[u8]) -> bool {
    value
        .split(|&b| b == b',')
        .any(|part| trim_ascii(part).eq_ignore_ascii_case(b"chunked"))
}

fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}

fn parse_head(data: &[u8]) -> io::Result<Option<ParsedHead>> {
    let mut headers_storage = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut headers_storage);

    match response.parse(data) {
        Ok(Status::Complete(header_len)) => {
            let status_code = response.code.unwrap_or(502);

            let content_length = response
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case("content-length"))
                .and_then(|h| std::str::from_utf8(h.value).ok())
                .and_then(|s| s.trim().parse().ok());

            let is_chunked = response
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case("transfer-encoding"))
                .map(|h| is_chunked_encoding(h.value))
                .unwrap_or(false);

            let is_connection_close = response
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case("connection"))
                .map(|h| trim_ascii(h.value).eq_ignore_ascii_case(b"close"))
                .unwrap_or(false);

            let content_type = response
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case("content-type"))
                .and_then(|h| std::str::from_utf8(h.value).ok())
                .map(|s| s.trim().to_string());

            Ok(Some(ParsedHead {
                status_code,
                header_len,
                content_length,
                is_chunked,
                is_connection_close,
                content_type,
            }))
        }
        Ok(Status::Partial) => Ok(None),
        Err(e) => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid HTTP response: {}", e),
        )),
    }
}

// ====================
// Chunked Transfer Encoding デコーダ（RFC 7230 Section 4.1 準拠）
// ====================
//
// トレーラーが存在する場合でも正確に終端を検出するために
// ステートマシンベースのパーサーを使用します。デコード済みの
// チャンクデータは出力バッファへ直接追記されます。
// ====================

#[derive(Debug, Clone, Copy, PartialEq)]
enum ChunkedState {
    ReadingChunkSize,
    ReadingChunkExtension,
    ExpectingChunkSizeLF,
    ReadingChunkData,
    ExpectingChunkDataCR,
    ExpectingChunkDataLF,
    ReadingTrailerLine,
    ExpectingTrailerLF,
    Complete,
}

/// Chunked転送デコーダ（ステートマシン）
struct ChunkedDecoder {
    state: ChunkedState,
    /// 現在のチャンクの残りバイト数
    chunk_remaining: u64,
    size_accumulator: u64,
    size_has_digit: bool,
    trailer_line_empty: bool,
}

impl ChunkedDecoder {
    fn new() -> Self {
        Self {
            state: ChunkedState::ReadingChunkSize,
            chunk_remaining: 0,
            size_accumulator: 0,
            size_has_digit: false,
            trailer_line_empty: true,
        }
    }

    /// データをフィードし、デコード済みチャンクデータを `out` へ追記
    /// 転送が完了した場合はtrueを返す
    fn feed(&mut self, data: &[u8], out: &mut Vec<u8>) -> bool {
        let mut i = 0;
        while i < data.len() {
            if self.state == ChunkedState::ReadingChunkData {
                // チャンクデータはバイト単位でなくまとめてコピー
                let take = (data.len() - i).min(self.chunk_remaining as usize);
                out.extend_from_slice(&data[i..i + take]);
                self.chunk_remaining -= take as u64;
                i += take;
                if self.chunk_remaining == 0 {
                    self.state = ChunkedState::ExpectingChunkDataCR;
                }
                continue;
            }
            if self.feed_byte(data[i]) {
                return true;
            }
            i += 1;
        }
        false
    }

    /// 1バイトを処理して状態を更新（チャンクデータ以外の制御バイト用）
    fn feed_byte(&mut self, byte: u8) -> bool {
        match self.state {
            ChunkedState::ReadingChunkSize => match byte {
                b'0'..=b'9' => {
                    self.size_accumulator = self
                        .size_accumulator
                        .saturating_mul(16)
                        .saturating_add((byte - b'0') as u64);
                    self.size_has_digit = true;
                }
                b'a'..=b'f' => {
                    self.size_accumulator = self
                        .size_accumulator
                        .saturating_mul(16)
                        .saturating_add((byte - b'a' + 10) as u64);
                    self.size_has_digit = true;
                }
                b'A'..=b'F' => {
                    self.size_accumulator = self
                        .size_accumulator
                        .saturating_mul(16)
                        .saturating_add((byte - b'A' + 10) as u64);
                    self.size_has_digit = true;
                }
                b';' => {
                    self.state = ChunkedState::ReadingChunkExtension;
                }
                b'\r' => {
                    self.state = ChunkedState::ExpectingChunkSizeLF;
                }
                _ => {
                    // 不正な文字はスキップ（緩い解析）
                }
            },

            ChunkedState::ReadingChunkExtension => {
                if byte == b'\r' {
                    self.state = ChunkedState::ExpectingChunkSizeLF;
                }
            }

            ChunkedState::ExpectingChunkSizeLF => {
                if byte == b'\n' {
                    if !self.size_has_digit {
                        self.state = ChunkedState::ReadingChunkSize;
                    } else if self.size_accumulator == 0 {
                        // 最後のチャンク（サイズ0）- トレーラーセクションへ
                        self.state = ChunkedState::ReadingTrailerLine;
                        self.trailer_line_empty = true;
                    } else {
                        self.chunk_remaining = self.size_accumulator;
                        self.state = ChunkedState::ReadingChunkData;
                    }
                    self.size_accumulator = 0;
                    self.size_has_digit = false;
                } else {
                    self.state = ChunkedState::ReadingChunkSize;
                    self.size_accumulator = 0;
                    self.size_has_digit = false;
                }
            }

            ChunkedState::ReadingChunkData => {
                // feed()側でまとめて処理されるためここには到達しない
                unreachable!("chunk data is consumed in feed()");
            }

            ChunkedState::ExpectingChunkDataCR => {
                if byte == b'\r' {
                    self.state = ChunkedState::ExpectingChunkDataLF;
                } else {
                    self.state = ChunkedState::ReadingChunkSize;
                }
            }

            ChunkedState::ExpectingChunkDataLF => {
                self.state = ChunkedState::ReadingChunkSize;
            }

            ChunkedState::ReadingTrailerLine => {
                if byte == b'\r' {
                    self.state = ChunkedState::ExpectingTrailerLF;
                } else {
                    self.trailer_line_empty = false;
                }
            }

            ChunkedState::ExpectingTrailerLF => {
                if byte == b'\n' {
                    if self.trailer_line_empty {
                        // 空行 = 転送完了
                        self.state = ChunkedState::Complete;
                        return true;
                    }
                    self.state = ChunkedState::ReadingTrailerLine;
                    self.trailer_line_empty = true;
                } else {
                    self.state = ChunkedState::ReadingTrailerLine;
                    self.trailer_line_empty = false;
                }
            }

            ChunkedState::Complete => {
                return true;
            }
        }
        false
    }
}

// ====================
// レスポンス受信
// ====================

/// 受信済みHTTPレスポンス
pub(crate) struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    /// 接続を再利用できるか
    pub keep_alive: bool,
}

/// リクエストバイト列を送信
pub(crate) async fn send_request<W: AsyncWriter>(
    stream: &mut W,
    request: Vec<u8>,
) -> io::Result<()> {
    match timeout(WRITE_TIMEOUT, stream.write_buf(request)).await {
        Ok((Ok(_), _)) => Ok(()),
        Ok((Err(e), _)) => Err(e),
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "upstream write timeout",
        )),
    }
}

/// レスポンスを受信してボディ全体を収集
///
/// Content-Length転送、chunked転送、Connection: close + EOF の
/// いずれにも対応します。
pub(crate) async fn read_response<R: AsyncReader>(stream: &mut R) -> io::Result<HttpResponse> {
    let mut accumulated: Vec<u8> = Vec::with_capacity(4096);

    // 1. ヘッダーを受信完了まで読み込む
    let head = loop {
        if let Some(head) = parse_head(&accumulated)? {
            break head;
        }
        if accumulated.len() > MAX_HEADER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "upstream response header too large",
            ));
        }

        let buf = vec![0u8; BUF_SIZE];
        let (res, returned_buf) = match timeout(READ_TIMEOUT, stream.read_buf(buf)).await {
            Ok(result) => result,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "upstream read timeout",
                ))
            }
        };
        match res {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before response header",
                ))
            }
            Ok(n) => accumulated.extend_from_slice(&returned_buf[..n]),
            Err(e) => return Err(e),
        }
    };

    let initial_body = &accumulated[head.header_len..];
    let mut keep_alive = !head.is_connection_close;
    let mut body: Vec<u8>;

    // 2. ボディを受信
    if head.is_chunked {
        body = Vec::with_capacity(initial_body.len());
        let mut decoder = ChunkedDecoder::new();
        let mut complete = decoder.feed(initial_body, &mut body);
        while !complete {
            let buf = vec![0u8; BUF_SIZE];
            let (res, returned_buf) = match timeout(READ_TIMEOUT, stream.read_buf(buf)).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "upstream read timeout",
                    ))
                }
            };
            match res {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed mid chunked body",
                    ))
                }
                Ok(n) => complete = decoder.feed(&returned_buf[..n], &mut body),
                Err(e) => return Err(e),
            }
        }
    } else if let Some(content_length) = head.content_length {
        body = initial_body.to_vec();
        while body.len() < content_length {
            let buf = vec![0u8; BUF_SIZE];
            let (res, returned_buf) = match timeout(READ_TIMEOUT, stream.read_buf(buf)).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "upstream read timeout",
                    ))
                }
            };
            match res {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed mid body",
                    ))
                }
                Ok(n) => body.extend_from_slice(&returned_buf[..n]),
                Err(e) => return Err(e),
            }
        }
        body.truncate(content_length);
    } else {
        // Content-Lengthもchunkedもない場合はEOFまで読む
        keep_alive = false;
        body = initial_body.to_vec();
        loop {
            let buf = vec![0u8; BUF_SIZE];
            let (res, returned_buf) = match timeout(READ_TIMEOUT, stream.read_buf(buf)).await {
                Ok(result) => result,
                Err(_) => break,
            };
            match res {
                Ok(0) => break,
                Ok(n) => body.extend_from_slice(&returned_buf[..n]),
                Err(_) => break,
            }
        }
    }

    Ok(HttpResponse {
        status: head.status_code,
        content_type: head.content_type,
        body,
        keep_alive,
    })
}
