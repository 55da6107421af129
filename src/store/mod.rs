//! オブジェクトストレージクライアント
//!
//! バッキングストアからオブジェクトを取得するためのトレイトと、
//! S3互換エンドポイント向けのHTTP/1.1クライアント実装を提供します。

mod http;
mod s3;

pub use s3::{Endpoint, S3Client};

use std::fmt;
use std::io;

/// ストアから取得したオブジェクト
#[derive(Debug, Clone)]
pub struct StoreObject {
    /// オブジェクト本体
    pub body: Vec<u8>,
    /// ストアが報告したContent-Type
    pub content_type: String,
}

/// ストア取得エラー
///
/// `NotFound` は正常系の結果（キーが存在しない）であり、
/// `Failure` のみがリクエスト全体を中断させるハードエラーです。
#[derive(Debug)]
pub enum StoreError {
    /// オブジェクトが存在しない（ネガティブキャッシュはしない）
    NotFound,
    /// 認証・ネットワーク・スロットリング等のハードエラー
    Failure(io::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "object not found in store"),
            StoreError::Failure(e) => write!(f, "store failure: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        StoreError::Failure(e)
    }
}

/// オブジェクトストレージの抽象
///
/// `GetObject(key) -> (bytes, contentType) | NotFound | Error` に相当する
/// 単一の操作のみを要求します。リトライ・タイムアウトポリシーは
/// 実装側の責務です。
#[allow(async_fn_in_trait)]
pub trait ObjectStore {
    /// キーに対応するオブジェクトを取得
    async fn get_object(&self, key: &str) -> Result<StoreObject, StoreError>;
}
